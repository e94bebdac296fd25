//! Live migration: pre-copy memory streaming with dirty-page tracking,
//! quiescing, final snapshot, and destination restoration.
//!
//! Generalized from a phased pre-copy shape (`Phase::{PreCopy,
//! StopAndCopy, Resume}`, as in the Zerovisor migration module) onto
//! this core's concrete wire format and `Machine`/device surface.

pub mod snapshot;
mod wire;

use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::machine::{Machine, MachineError};
use snapshot::SnapshotError;
use wire::{expect_message, read_message, write_message, MessageType};

const PAGE_SIZE: u64 = 4096;
const MAX_PRECOPY_ROUNDS: u32 = 3;
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("invalid destination address {0}")]
    BadAddress(String),
    #[error("malformed control-socket command: {0:?}")]
    BadControlCommand(String),
    #[error("truncated dirty-page payload")]
    TruncatedDirtyPayload,
    #[error("Done message received before a Snapshot message")]
    DoneBeforeSnapshot,
    #[error("unexpected migration message type: {0}")]
    UnexpectedMessage(String),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Runs the source side of a migration: dials `dest_addr`, streams
/// memory and device state, and blocks until the destination
/// acknowledges with Ready.
///
/// `quiesce_vcpus` is called once pre-copy has converged (or hit the
/// round limit); it must not return until every vCPU worker has
/// observed the stop request and exited its run call. This module owns
/// none of those threads; that's the orchestrator's job, so it takes
/// the wait as a callback instead.
pub fn migrate_source(
    machine: &Machine,
    disk_path: Option<&Path>,
    dest_addr: &str,
    quiesce_vcpus: impl FnOnce(),
) -> Result<(), MigrationError> {
    let socket_addr: SocketAddr = dest_addr
        .parse()
        .map_err(|_| MigrationError::BadAddress(dest_addr.to_string()))?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, DIAL_TIMEOUT)?;
    info!(addr = dest_addr, "migration: connected to destination");
    run_source(machine, disk_path, &mut stream, quiesce_vcpus)
}

fn run_source(
    machine: &Machine,
    disk_path: Option<&Path>,
    stream: &mut TcpStream,
    quiesce_vcpus: impl FnOnce(),
) -> Result<(), MigrationError> {
    machine.enable_dirty_logging()?;

    let mem_size = machine.mem_size();
    let mut full = vec![0u8; mem_size as usize];
    machine.read_at(0, &mut full)?;
    write_message(stream, MessageType::MemoryFull, &full)?;
    drop(full);

    let total_pages = mem_size / PAGE_SIZE;
    for round in 1..=MAX_PRECOPY_ROUNDS {
        let bitmap = machine.dirty_log(machine.dirty_log_slot())?;
        let dirty = count_dirty_pages(&bitmap);
        debug!(round, dirty, total_pages, "migration pre-copy round");
        if dirty == 0 || dirty.saturating_mul(100) < total_pages {
            break;
        }
        let payload = encode_dirty_payload(&bitmap, machine)?;
        write_message(stream, MessageType::MemoryDirty, &payload)?;
    }

    quiesce_vcpus();
    machine.quiesce_virtio();

    if let Some(path) = disk_path {
        let disk = std::fs::read(path)?;
        write_message(stream, MessageType::DiskFull, &disk)?;
    }

    let bitmap = machine.dirty_log(machine.dirty_log_slot())?;
    if count_dirty_pages(&bitmap) > 0 {
        let payload = encode_dirty_payload(&bitmap, machine)?;
        write_message(stream, MessageType::MemoryDirty, &payload)?;
    }

    let snapshot = snapshot::capture(machine)?;
    let encoded = bincode::serialize(&snapshot)?;
    write_message(stream, MessageType::Snapshot, &encoded)?;
    write_message(stream, MessageType::Done, &[])?;
    expect_message(stream, MessageType::Ready)?;

    info!("migration: source completed, destination is Ready");
    Ok(())
}

/// Runs the destination side: listens once on `listen_addr`, applies
/// every message until Done, then calls `start_vcpus` once the
/// snapshot has been restored.
pub fn migrate_destination(
    machine: &Machine,
    disk_path: Option<&Path>,
    listen_addr: &str,
    start_vcpus: impl FnOnce(),
) -> Result<(), MigrationError> {
    let listener = TcpListener::bind(listen_addr)?;
    info!(addr = listen_addr, "migration: awaiting source connection");
    let (mut stream, peer) = listener.accept()?;
    info!(?peer, "migration: source connected");
    run_destination(machine, disk_path, &mut stream, start_vcpus)
}

fn run_destination(
    machine: &Machine,
    disk_path: Option<&Path>,
    stream: &mut TcpStream,
    start_vcpus: impl FnOnce(),
) -> Result<(), MigrationError> {
    let mut pending_snapshot = None;

    loop {
        let (message_type, payload) = read_message(stream)?;
        match message_type {
            MessageType::MemoryFull => {
                machine.write_at(0, &payload)?;
            }
            MessageType::MemoryDirty => {
                apply_dirty_payload(&payload, machine)?;
            }
            MessageType::DiskFull => {
                if let Some(path) = disk_path {
                    std::fs::write(path, &payload)?;
                }
            }
            MessageType::Snapshot => {
                let decoded: snapshot::Snapshot = bincode::deserialize(&payload)?;
                pending_snapshot = Some(decoded);
            }
            MessageType::Done => {
                let snapshot = pending_snapshot.take().ok_or(MigrationError::DoneBeforeSnapshot)?;
                snapshot::apply(machine, &snapshot)?;
                write_message(stream, MessageType::Ready, &[])?;
                start_vcpus();
                info!("migration: destination restored and running");
                return Ok(());
            }
            other => return Err(MigrationError::UnexpectedMessage(format!("{other:?}"))),
        }
    }
}

/// Blocks for one `MIGRATE host:port\n` command on `socket_path`,
/// returning the parsed destination address. Removes any stale socket
/// file left by a previous bind so the caller can call this in a loop,
/// one bind-accept cycle per migration request.
pub fn accept_control_command(socket_path: &Path) -> Result<String, MigrationError> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    let (stream, _) = listener.accept()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    parse_control_command(line.trim())
}

fn parse_control_command(line: &str) -> Result<String, MigrationError> {
    line.strip_prefix("MIGRATE ")
        .map(str::to_string)
        .ok_or_else(|| MigrationError::BadControlCommand(line.to_string()))
}

fn count_dirty_pages(bitmap: &[u64]) -> u64 {
    bitmap.iter().map(|word| word.count_ones() as u64).sum()
}

/// Packs `{u64 bitmap_length, bitmap_bytes, packed_page_data}`: the
/// bitmap as little-endian u64 words, followed by every dirty page's
/// 4096 bytes in bitmap-scan order.
fn encode_dirty_payload(bitmap: &[u64], machine: &Machine) -> Result<Vec<u8>, MigrationError> {
    let bitmap_bytes: Vec<u8> = bitmap.iter().flat_map(|word| word.to_le_bytes()).collect();
    let mut payload = Vec::with_capacity(8 + bitmap_bytes.len());
    payload.extend_from_slice(&(bitmap_bytes.len() as u64).to_be_bytes());
    payload.extend_from_slice(&bitmap_bytes);

    let total_pages = machine.mem_size() / PAGE_SIZE;
    let mut page_buf = [0u8; PAGE_SIZE as usize];
    for page in 0..total_pages {
        let word = bitmap[(page / 64) as usize];
        if word & (1 << (page % 64)) != 0 {
            machine.read_at(page * PAGE_SIZE, &mut page_buf)?;
            payload.extend_from_slice(&page_buf);
        }
    }
    Ok(payload)
}

fn apply_dirty_payload(payload: &[u8], machine: &Machine) -> Result<(), MigrationError> {
    let bitmap_len = payload
        .get(0..8)
        .map(|b| u64::from_be_bytes(b.try_into().unwrap()) as usize)
        .ok_or(MigrationError::TruncatedDirtyPayload)?;
    let bitmap_bytes = payload
        .get(8..8 + bitmap_len)
        .ok_or(MigrationError::TruncatedDirtyPayload)?;
    let mut page_data = payload
        .get(8 + bitmap_len..)
        .ok_or(MigrationError::TruncatedDirtyPayload)?;

    for (word_idx, word_bytes) in bitmap_bytes.chunks_exact(8).enumerate() {
        let word = u64::from_le_bytes(word_bytes.try_into().unwrap());
        for bit in 0..64u64 {
            if word & (1 << bit) == 0 {
                continue;
            }
            if page_data.len() < PAGE_SIZE as usize {
                return Err(MigrationError::TruncatedDirtyPayload);
            }
            let page_idx = word_idx as u64 * 64 + bit;
            let (page, rest) = page_data.split_at(PAGE_SIZE as usize);
            machine.write_at(page_idx * PAGE_SIZE, page)?;
            page_data = rest;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_command() {
        assert_eq!(
            parse_control_command("MIGRATE 10.0.0.2:7780").unwrap(),
            "10.0.0.2:7780"
        );
    }

    #[test]
    fn test_parse_control_command_rejects_garbage() {
        assert!(parse_control_command("PLEASE MOVE ME").is_err());
    }

    #[test]
    fn test_count_dirty_pages() {
        assert_eq!(count_dirty_pages(&[0b101, 0]), 2);
        assert_eq!(count_dirty_pages(&[0, 0]), 0);
        assert_eq!(count_dirty_pages(&[u64::MAX]), 64);
    }

    #[test]
    fn test_encode_decode_dirty_payload_roundtrips_bitmap_framing() {
        // Exercise only the framing (length prefix + LE word layout),
        // not actual guest memory access.
        let bitmap_bytes: Vec<u8> = [0b1u64, 0u64].iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(bitmap_bytes.len() as u64).to_be_bytes());
        payload.extend_from_slice(&bitmap_bytes);
        payload.extend_from_slice(&[0u8; PAGE_SIZE as usize]);

        let bitmap_len = u64::from_be_bytes(payload[0..8].try_into().unwrap()) as usize;
        assert_eq!(bitmap_len, 16);
        let decoded_words: Vec<u64> = payload[8..8 + bitmap_len]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(decoded_words, vec![1, 0]);
    }
}

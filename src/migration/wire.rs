//! Framed binary wire protocol: `{u32 type (big-endian), u64
//! payload_length (big-endian), payload}`, one message per `read`/
//! `write` pair, no messages in flight concurrently on the same
//! connection.

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Snapshot = 1,
    MemoryFull = 2,
    MemoryDirty = 3,
    Done = 4,
    Ready = 5,
    DiskFull = 6,
}

impl MessageType {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Snapshot,
            2 => Self::MemoryFull,
            3 => Self::MemoryDirty,
            4 => Self::Done,
            5 => Self::Ready,
            6 => Self::DiskFull,
            _ => return None,
        })
    }
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("unknown migration message type {0}")]
    UnknownType(u32),
    #[error("unexpected migration message: wanted {wanted:?}, got {got:?}")]
    Unexpected { wanted: MessageType, got: MessageType },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn write_message(
    stream: &mut impl Write,
    message_type: MessageType,
    payload: &[u8],
) -> Result<(), WireError> {
    stream.write_all(&(message_type as u32).to_be_bytes())?;
    stream.write_all(&(payload.len() as u64).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn read_message(stream: &mut impl Read) -> Result<(MessageType, Vec<u8>), WireError> {
    let mut type_buf = [0u8; 4];
    stream.read_exact(&mut type_buf)?;
    let message_type =
        MessageType::from_u32(u32::from_be_bytes(type_buf)).ok_or_else(|| {
            WireError::UnknownType(u32::from_be_bytes(type_buf))
        })?;

    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf)?;
    let len = u64::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((message_type, payload))
}

/// Reads one message and fails unless it's `wanted`.
pub fn expect_message(stream: &mut impl Read, wanted: MessageType) -> Result<Vec<u8>, WireError> {
    let (got, payload) = read_message(stream)?;
    if got != wanted {
        return Err(WireError::Unexpected { wanted, got });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip_preserves_type_and_payload() {
        let mut buf = Vec::new();
        write_message(&mut buf, MessageType::MemoryFull, b"hello").unwrap();

        let mut cursor = Cursor::new(buf);
        let (msg_type, payload) = read_message(&mut cursor).unwrap();
        assert_eq!(msg_type, MessageType::MemoryFull);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_message(&mut cursor),
            Err(WireError::UnknownType(99))
        ));
    }

    #[test]
    fn test_expect_message_rejects_mismatch() {
        let mut buf = Vec::new();
        write_message(&mut buf, MessageType::Ready, &[]).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(expect_message(&mut cursor, MessageType::Done).is_err());
    }
}

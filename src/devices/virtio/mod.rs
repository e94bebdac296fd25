//! Legacy, port-based virtio transport.
//!
//! Reworked from a virtio-mmio v2 register layout: this core exposes
//! virtio devices as port-I/O BARs (see [`crate::devices::pci`]) rather
//! than fixed MMIO windows, the common header is the legacy 20-byte
//! layout (no `queue_ready`/feature-select registers), and the queue
//! size is fixed at 32 rather than guest-negotiable.
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>
//! (legacy interface, section 4.1.4 pre-1.0 wire format).

pub mod blk;
pub mod net;
pub mod queue;

pub use queue::{VirtQueue, VirtqDesc, QUEUE_SIZE};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregates the virtio device cores' fallible paths for the
/// top-level [`crate::error::Error`].
#[derive(Error, Debug)]
pub enum VirtioError {
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Blk(#[from] blk::BlkError),
}

// Common header field offsets within the device's port BAR.
pub const REG_HOST_FEATURES: u16 = 0;
pub const REG_GUEST_FEATURES: u16 = 4;
pub const REG_QUEUE_PFN: u16 = 8;
pub const REG_QUEUE_NUM: u16 = 12;
pub const REG_QUEUE_SEL: u16 = 14;
pub const REG_QUEUE_NOTIFY: u16 = 16;
pub const REG_STATUS: u16 = 18;
pub const REG_ISR: u16 = 19;
pub const COMMON_HEADER_SIZE: u16 = 20;

pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;

pub const ISR_QUEUE: u8 = 1;

/// Migration-record slice of a [`VirtioCommon`]'s state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtioCommonSnapshot {
    pub guest_features: u32,
    pub queue_sel: u16,
    pub status: u8,
}

/// Full migration record for one virtio device: the common header plus
/// every queue's guest physical address and last-seen available index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtioDeviceSnapshot {
    pub common: VirtioCommonSnapshot,
    pub queues: Vec<VirtQueue>,
}

/// The part of a virtio device shared between blk and net: feature
/// negotiation, queue selection/PFN, notify dispatch, and the
/// read-to-clear ISR byte.
///
/// `isr` is an `Arc<AtomicU8>` rather than a plain field because
/// worker threads assert it directly (spec: "single-byte, naturally
/// atomic on x86_64, read-to-clear") without going through the port
/// dispatch path.
pub struct VirtioCommon {
    host_features: u32,
    guest_features: u32,
    queue_sel: u16,
    status: u8,
    isr: Arc<AtomicU8>,
    kickers: Vec<SyncSender<()>>,
}

impl VirtioCommon {
    pub fn new(host_features: u32, kickers: Vec<SyncSender<()>>) -> Self {
        Self {
            host_features,
            guest_features: 0,
            queue_sel: 0,
            status: 0,
            isr: Arc::new(AtomicU8::new(0)),
            kickers,
        }
    }

    pub fn isr_handle(&self) -> Arc<AtomicU8> {
        self.isr.clone()
    }

    pub fn num_queues(&self) -> u16 {
        self.kickers.len() as u16
    }

    /// Guest-negotiated state only; `host_features` and the live ISR
    /// byte are re-derived on restore (host features from the binary,
    /// ISR starts clear), not carried over the wire.
    pub fn snapshot(&self) -> VirtioCommonSnapshot {
        VirtioCommonSnapshot {
            guest_features: self.guest_features,
            queue_sel: self.queue_sel,
            status: self.status,
        }
    }

    pub fn restore(&mut self, snapshot: &VirtioCommonSnapshot) {
        self.guest_features = snapshot.guest_features;
        self.queue_sel = snapshot.queue_sel;
        self.status = snapshot.status;
    }

    /// Handles an `in` access to the common header. `offset` is
    /// relative to the device's BAR base.
    pub fn io_in(&mut self, queues: &[VirtQueue], offset: u16, data: &mut [u8]) {
        match offset {
            REG_HOST_FEATURES if data.len() == 4 => {
                data.copy_from_slice(&self.host_features.to_le_bytes())
            }
            REG_QUEUE_NUM if data.len() == 2 => {
                let num = if (self.queue_sel as usize) < queues.len() {
                    QUEUE_SIZE
                } else {
                    0
                };
                data.copy_from_slice(&num.to_le_bytes());
            }
            REG_STATUS if data.len() == 1 => data[0] = self.status,
            _ => {
                data.fill(0);
                let span_end = offset as u32 + data.len() as u32;
                if (offset as u32..span_end).contains(&(REG_ISR as u32)) {
                    let isr = self.isr.swap(0, Ordering::AcqRel);
                    data[(REG_ISR - offset) as usize] = isr;
                }
            }
        }
    }

    /// Handles an `out` access to the common header. `queues` is the
    /// device's own queue array (len 1 for blk, 2 for net).
    pub fn io_out(&mut self, queues: &mut [VirtQueue], offset: u16, data: &[u8]) {
        match offset {
            REG_GUEST_FEATURES if data.len() == 4 => {
                self.guest_features =
                    u32::from_le_bytes(data.try_into().unwrap()) & self.host_features;
            }
            REG_QUEUE_PFN if data.len() == 4 => {
                if let Some(q) = queues.get_mut(self.queue_sel as usize) {
                    q.set_pfn(u32::from_le_bytes(data.try_into().unwrap()));
                }
            }
            REG_QUEUE_SEL if data.len() == 2 => {
                self.queue_sel = u16::from_le_bytes(data.try_into().unwrap());
            }
            REG_QUEUE_NOTIFY if data.len() == 2 => {
                let queue_idx = u16::from_le_bytes(data.try_into().unwrap());
                if let Some(kicker) = self.kickers.get(queue_idx as usize) {
                    let _ = kicker.try_send(());
                }
            }
            REG_STATUS if data.len() == 1 => self.status = data[0],
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isr_read_clears_on_exact_offset() {
        let mut common = VirtioCommon::new(0, vec![]);
        common.isr.store(ISR_QUEUE, Ordering::Release);

        let mut data = [0u8; 1];
        common.io_in(&[], REG_ISR, &mut data);
        assert_eq!(data[0], ISR_QUEUE);
        assert_eq!(common.isr.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_isr_read_clears_when_spanned_by_wider_read() {
        let mut common = VirtioCommon::new(0, vec![]);
        common.isr.store(ISR_QUEUE, Ordering::Release);

        let mut data = [0xffu8; 4];
        common.io_in(&[], REG_QUEUE_NOTIFY, &mut data);
        assert_eq!(data, [0, 0, 0, ISR_QUEUE]);
        assert_eq!(common.isr.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_read_outside_isr_span_leaves_it_set() {
        let mut common = VirtioCommon::new(0, vec![]);
        common.isr.store(ISR_QUEUE, Ordering::Release);

        let mut data = [0xffu8; 2];
        common.io_in(&[], REG_QUEUE_SEL, &mut data);
        assert_eq!(data, [0, 0]);
        assert_eq!(common.isr.load(Ordering::Acquire), ISR_QUEUE);
    }
}

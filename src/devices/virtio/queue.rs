//! Split-ring virtqueue layout and descriptor-chain traversal.
//!
//! The virtio-mmio v2 transport these descriptor shapes were built for
//! let the guest choose its own queue size; here queues are
//! legacy-transport and fixed at 32 descriptors, and every ring index
//! access goes through a `#[inline(never)]` function boundary so the
//! compiler cannot hoist a stale `avail.idx` or `used.idx` out of a
//! worker's poll loop, since the two are written by different OS
//! threads with no other synchronization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boot::GuestMemory;

pub const QUEUE_SIZE: u16 = 32;

pub const DESC_F_NEXT: u16 = 0x1;
pub const DESC_F_WRITE: u16 = 0x2;
pub const DESC_F_INDIRECT: u16 = 0x4;

const DESC_ENTRY_SIZE: u64 = 16;
const DESC_TABLE_BYTES: u64 = QUEUE_SIZE as u64 * DESC_ENTRY_SIZE;
const AVAIL_RING_BYTES: u64 = 6 + 2 * QUEUE_SIZE as u64;
const USED_RING_OFFSET: u64 = (DESC_TABLE_BYTES + AVAIL_RING_BYTES).div_ceil(4096) * 4096;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("guest memory access failed at {0:#x}")]
    MemoryFault(u64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One split-ring queue. `guest_phys_addr` is the base address the
/// guest published via the PFN register (0 until configured);
/// `last_seen_avail_idx` is snapshotted for migration so the
/// destination resumes draining from the same point.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct VirtQueue {
    pub guest_phys_addr: u64,
    pub last_seen_avail_idx: u16,
}

impl VirtQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pfn(&mut self, pfn: u32) {
        self.guest_phys_addr = (pfn as u64) << 12;
    }

    pub fn is_configured(&self) -> bool {
        self.guest_phys_addr != 0
    }

    fn desc_table_addr(&self) -> u64 {
        self.guest_phys_addr
    }

    fn avail_ring_addr(&self) -> u64 {
        self.guest_phys_addr + DESC_TABLE_BYTES
    }

    fn used_ring_addr(&self) -> u64 {
        self.guest_phys_addr + USED_RING_OFFSET
    }

    pub fn has_pending(&self, memory: &GuestMemory) -> bool {
        self.is_configured() && read_avail_idx(memory, self.avail_ring_addr()) != self.last_seen_avail_idx
    }

    /// Pops the next available descriptor chain head, advancing
    /// `last_seen_avail_idx`. Returns `None` if the guest hasn't
    /// published anything new.
    pub fn pop_avail(&mut self, memory: &GuestMemory) -> Option<u16> {
        if !self.has_pending(memory) {
            return None;
        }
        let ring_slot_addr =
            self.avail_ring_addr() + 4 + (self.last_seen_avail_idx % QUEUE_SIZE) as u64 * 2;
        let head = read_u16(memory, ring_slot_addr);
        self.last_seen_avail_idx = self.last_seen_avail_idx.wrapping_add(1);
        Some(head)
    }

    pub fn read_desc(&self, memory: &GuestMemory, idx: u16) -> Option<VirtqDesc> {
        if idx >= QUEUE_SIZE {
            return None;
        }
        let addr = self.desc_table_addr() + idx as u64 * DESC_ENTRY_SIZE;
        let mut buf = [0u8; DESC_ENTRY_SIZE as usize];
        memory.read(addr, &mut buf).ok()?;
        Some(VirtqDesc {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }

    /// Walks a descriptor chain starting at `head`, following `next`
    /// while `DESC_F_NEXT` is set.
    pub fn read_chain(&self, memory: &GuestMemory, head: u16) -> Result<Vec<VirtqDesc>, QueueError> {
        let mut chain = Vec::new();
        let mut idx = head;
        loop {
            let desc = self
                .read_desc(memory, idx)
                .ok_or(QueueError::MemoryFault(self.desc_table_addr()))?;
            let continues = desc.flags & DESC_F_NEXT != 0;
            let next = desc.next;
            chain.push(desc);
            if !continues {
                break;
            }
            idx = next;
        }
        Ok(chain)
    }

    /// Records one used-ring entry for `desc_id` and publishes it by
    /// incrementing `used.idx`.
    pub fn push_used(&self, memory: &GuestMemory, desc_id: u16, len: u32) -> Result<(), QueueError> {
        let used_idx = read_u16(memory, self.used_ring_addr() + 2);
        let elem_addr = self.used_ring_addr() + 4 + (used_idx % QUEUE_SIZE) as u64 * 8;
        memory
            .write(elem_addr, &(desc_id as u32).to_le_bytes())
            .map_err(|_| QueueError::MemoryFault(elem_addr))?;
        memory
            .write(elem_addr + 4, &len.to_le_bytes())
            .map_err(|_| QueueError::MemoryFault(elem_addr + 4))?;
        write_u16(memory, self.used_ring_addr() + 2, used_idx.wrapping_add(1));
        Ok(())
    }
}

#[inline(never)]
fn read_avail_idx(memory: &GuestMemory, avail_ring_addr: u64) -> u16 {
    read_u16(memory, avail_ring_addr + 2)
}

#[inline(never)]
fn read_u16(memory: &GuestMemory, addr: u64) -> u16 {
    let mut buf = [0u8; 2];
    match memory.read(addr, &mut buf) {
        Ok(()) => u16::from_le_bytes(buf),
        Err(_) => 0,
    }
}

#[inline(never)]
fn write_u16(memory: &GuestMemory, addr: u64, value: u16) {
    let _ = memory.write(addr, &value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_queue(memory: &GuestMemory) -> VirtQueue {
        let mut q = VirtQueue::new();
        q.set_pfn(1); // guest_phys_addr = 4096
        // avail.idx starts at 0
        memory.write_u32(0, 0).unwrap();
        q
    }

    #[test]
    fn test_pop_avail_advances_and_stops() {
        let memory = GuestMemory::new(64 * 1024).unwrap();
        let mut q = setup_queue(&memory);

        // descriptor 0 at desc_table
        let desc_table = q.desc_table_addr();
        memory.write(desc_table, &0u64.to_le_bytes()).unwrap(); // addr
        memory.write(desc_table + 8, &16u32.to_le_bytes()).unwrap(); // len
        memory.write(desc_table + 12, &0u16.to_le_bytes()).unwrap(); // flags
        memory.write(desc_table + 14, &0u16.to_le_bytes()).unwrap(); // next

        let avail = q.avail_ring_addr();
        memory.write_u16_test(avail, 0); // flags
        memory.write_u16_test(avail + 2, 1); // idx = 1
        memory.write_u16_test(avail + 4, 0); // ring[0] = desc 0

        assert!(q.has_pending(&memory));
        assert_eq!(q.pop_avail(&memory), Some(0));
        assert_eq!(q.last_seen_avail_idx, 1);
        assert!(!q.has_pending(&memory));
    }

    #[test]
    fn test_push_used_increments_idx() {
        let memory = GuestMemory::new(64 * 1024).unwrap();
        let q = setup_queue(&memory);
        q.push_used(&memory, 3, 512).unwrap();
        assert_eq!(read_u16(&memory, q.used_ring_addr() + 2), 1);
    }

    trait WriteU16Test {
        fn write_u16_test(&self, addr: u64, val: u16);
    }
    impl WriteU16Test for GuestMemory {
        fn write_u16_test(&self, addr: u64, val: u16) {
            self.write(addr, &val.to_le_bytes()).unwrap();
        }
    }
}

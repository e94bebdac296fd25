//! The Snapshot record: VM-wide clock/IRQ-chip/PIT state, per-vCPU
//! register state, and per-device state. Capturing and applying it is
//! the last step of the source loop and the first step of destination
//! restoration.
//!
//! `kvm-bindings` types (`kvm_clock_data`, `kvm_regs`, ...) are plain
//! `#[repr(C)]` structs with no `serde` impls of their own, so they
//! cross the wire as opaque byte blobs rather than field-by-field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::virtio::VirtioDeviceSnapshot;
use crate::kvm::KvmError;
use crate::machine::{Machine, MachineError};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Driver(#[from] KvmError),
    #[error(transparent)]
    Machine(#[from] MachineError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcpuSnapshot {
    pub regs: Vec<u8>,
    pub sregs: Vec<u8>,
    pub msrs: Vec<(u32, u64)>,
    pub lapic: Vec<u8>,
    pub events: Vec<u8>,
    pub mp_state: Vec<u8>,
    pub debug_regs: Vec<u8>,
    pub xcrs: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub serial: Option<(u8, u8)>,
    pub virtio_blk: Option<VirtioDeviceSnapshot>,
    pub virtio_net: Option<VirtioDeviceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub clock: Vec<u8>,
    /// Master PIC, slave PIC, IOAPIC, in that order (`chip_id` 0..3).
    pub irq_chip: [Vec<u8>; 3],
    pub pit2: Vec<u8>,
    pub vcpus: Vec<VcpuSnapshot>,
    pub devices: DeviceSnapshot,
}

/// Captures a full Snapshot from a quiesced `Machine`: vCPUs stopped,
/// virtio workers closed. Capturing from a running machine would race
/// `last_seen_avail_idx` and the per-vCPU register state against the
/// threads still mutating them.
pub fn capture(machine: &Machine) -> Result<Snapshot, SnapshotError> {
    let vm = machine.vm();

    let clock = as_bytes(&vm.get_clock()?);
    let irq_chip = [
        as_bytes(&vm.get_irqchip(0)?),
        as_bytes(&vm.get_irqchip(1)?),
        as_bytes(&vm.get_irqchip(2)?),
    ];
    let pit2 = as_bytes(&vm.get_pit2()?);

    let mut vcpus = Vec::with_capacity(machine.vcpu_count());
    for index in 0..machine.vcpu_count() {
        vcpus.push(machine.with_vcpu(index, |vcpu| {
            Ok(VcpuSnapshot {
                regs: as_bytes(&vcpu.get_regs()?),
                sregs: as_bytes(&vcpu.get_sregs()?),
                msrs: vcpu.get_msrs()?,
                lapic: as_bytes(&vcpu.get_lapic()?),
                events: as_bytes(&vcpu.get_vcpu_events()?),
                mp_state: as_bytes(&vcpu.get_mp_state()?),
                debug_regs: as_bytes(&vcpu.get_debug_regs()?),
                xcrs: as_bytes(&vcpu.get_xcrs()?),
            })
        })?);
    }

    let devices = DeviceSnapshot {
        serial: machine.serial().map(|s| s.lock().unwrap().snapshot()),
        virtio_blk: machine.virtio_blk().map(|b| b.lock().unwrap().snapshot()),
        virtio_net: machine.virtio_net().map(|n| n.lock().unwrap().snapshot()),
    };

    Ok(Snapshot {
        clock,
        irq_chip,
        pit2,
        vcpus,
        devices,
    })
}

/// Restores a Snapshot onto a freshly created `Machine` (same vCPU
/// count and memory size as the source, memory already copied in by
/// the destination's MemoryFull/MemoryDirty handling).
pub fn apply(machine: &Machine, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let vm = machine.vm();

    for (index, vcpu_snapshot) in snapshot.vcpus.iter().enumerate() {
        machine.with_vcpu(index, |vcpu| {
            vcpu.set_regs(&from_bytes(&vcpu_snapshot.regs))?;
            vcpu.set_sregs(&from_bytes(&vcpu_snapshot.sregs))?;
            vcpu.set_msrs(&vcpu_snapshot.msrs)?;
            vcpu.set_lapic(&from_bytes(&vcpu_snapshot.lapic))?;
            vcpu.set_vcpu_events(&from_bytes(&vcpu_snapshot.events))?;
            vcpu.set_mp_state(&from_bytes(&vcpu_snapshot.mp_state))?;
            vcpu.set_debug_regs(&from_bytes(&vcpu_snapshot.debug_regs))?;
            vcpu.set_xcrs(&from_bytes(&vcpu_snapshot.xcrs))?;
            Ok(())
        })?;
    }

    vm.set_clock(&from_bytes(&snapshot.clock))?;
    for chip in &snapshot.irq_chip {
        vm.set_irqchip(&from_bytes(chip))?;
    }
    vm.set_pit2(&from_bytes(&snapshot.pit2))?;

    if let (Some(serial), Some(&(ier, lcr))) = (machine.serial(), snapshot.devices.serial.as_ref())
    {
        serial.lock().unwrap().restore(ier, lcr);
    }
    if let (Some(blk), Some(saved)) = (machine.virtio_blk(), snapshot.devices.virtio_blk.as_ref())
    {
        blk.lock().unwrap().restore(saved);
    }
    if let (Some(net), Some(saved)) = (machine.virtio_net(), snapshot.devices.virtio_net.as_ref())
    {
        net.lock().unwrap().restore(saved);
    }

    Ok(())
}

/// Copies a plain-old-data struct's bytes out, for wire types with no
/// `serde` impl of their own.
fn as_bytes<T: Copy>(value: &T) -> Vec<u8> {
    let ptr = value as *const T as *const u8;
    // Safety: `T: Copy` rules out any type with a non-trivial `Drop`
    // or interior pointers that would make a raw byte copy unsound.
    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()) }.to_vec()
}

/// Reconstructs a plain-old-data struct from a byte blob previously
/// produced by [`as_bytes`]. Zero-fills any trailing bytes the source
/// didn't send (there should be none if both ends agree on `T`).
fn from_bytes<T: Copy>(bytes: &[u8]) -> T {
    // Safety: a zeroed bit pattern is valid for every field kind this
    // module stores (fixed-size integers and arrays thereof).
    let mut value: T = unsafe { std::mem::zeroed() };
    let len = std::mem::size_of::<T>().min(bytes.len());
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), &mut value as *mut T as *mut u8, len);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    struct Pod {
        a: u32,
        b: u64,
    }

    #[test]
    fn test_bytes_roundtrip() {
        let original = Pod { a: 7, b: 99 };
        let bytes = as_bytes(&original);
        let restored: Pod = from_bytes(&bytes);
        assert_eq!(original, restored);
    }

    #[test]
    fn test_device_snapshot_defaults_to_all_absent() {
        let snapshot = DeviceSnapshot::default();
        assert!(snapshot.serial.is_none());
        assert!(snapshot.virtio_blk.is_none());
        assert!(snapshot.virtio_net.is_none());
    }
}

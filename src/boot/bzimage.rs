//! Legacy 32-bit bzImage loader and initial register setup.
//!
//! Header validation follows the bzImage boot protocol directly; the
//! core hands the guest a flat 32-bit protected mode entry at exactly
//! 0x100000 (the kernel's own decompressor does the 32→64 transition),
//! instead of pre-building long mode for it.

use std::fs::File;
use std::io::Read;

use kvm_bindings::{kvm_regs, kvm_segment};

use super::layout;
use super::memory::GuestMemory;
use super::BootError;
use crate::kvm::VcpuFd;

const BOOT_MAGIC: u32 = 0x5372_6448; // "HdrS"
const MIN_BOOT_VERSION: u16 = 0x0206;
const SETUP_HEADER_OFFSET: usize = 0x1f1;

pub struct LoadedKernel {
    pub setup_header: Vec<u8>,
}

/// Reads the first four bytes of `path` and reports whether they're the
/// ELF magic, which the PVH entry note lives behind.
pub fn is_elf(path: &std::path::Path) -> Result<bool, BootError> {
    let mut file = File::open(path).map_err(BootError::ReadKernel)?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return Ok(false);
    }
    Ok(magic == [0x7f, b'E', b'L', b'F'])
}

pub fn load_kernel(
    memory: &GuestMemory,
    kernel_path: &std::path::Path,
) -> Result<LoadedKernel, BootError> {
    let mut file = File::open(kernel_path).map_err(BootError::ReadKernel)?;
    let mut kernel_data = Vec::new();
    file.read_to_end(&mut kernel_data)
        .map_err(BootError::ReadKernel)?;

    if kernel_data.len() < 0x250 {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let magic = u32::from_le_bytes([
        kernel_data[0x202],
        kernel_data[0x203],
        kernel_data[0x204],
        kernel_data[0x205],
    ]);
    if magic != BOOT_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "invalid boot magic: expected {BOOT_MAGIC:#x}, got {magic:#x}"
        )));
    }

    let version = u16::from_le_bytes([kernel_data[0x206], kernel_data[0x207]]);
    if version < MIN_BOOT_VERSION {
        return Err(BootError::InvalidKernel(format!(
            "boot protocol {version:#x} is older than the minimum {MIN_BOOT_VERSION:#x}"
        )));
    }

    let setup_sects = kernel_data[0x1f1];
    let setup_sects = if setup_sects == 0 { 4 } else { setup_sects };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= kernel_data.len() {
        return Err(BootError::InvalidKernel(
            "setup size exceeds kernel image size".into(),
        ));
    }

    let kernel_code = &kernel_data[setup_size..];
    memory.write(layout::HIMEM_START, kernel_code)?;

    let header_end = (SETUP_HEADER_OFFSET + 0x80).min(kernel_data.len());
    let setup_header = kernel_data[SETUP_HEADER_OFFSET..header_end].to_vec();

    Ok(LoadedKernel { setup_header })
}

pub fn load_initrd(memory: &GuestMemory, initrd_path: &std::path::Path) -> Result<u32, BootError> {
    let mut file = File::open(initrd_path).map_err(BootError::ReadKernel)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(BootError::ReadKernel)?;
    memory.write(layout::INITRD_START, &data)?;
    Ok(data.len() as u32)
}

/// Flat 32-bit protected-mode segment: base 0, limit 4 GiB, granular.
fn flat_segment(code: bool) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: if code { 0x10 } else { 0x18 },
        type_: if code { 0xb } else { 0x3 },
        present: 1,
        dpl: 0,
        db: 1,
        s: 1,
        l: 0,
        g: 1,
        ..Default::default()
    }
}

/// Sets up the exact CPU state the legacy 32-bit boot protocol
/// requires: RIP at the kernel's load address, RSI pointing at the
/// boot_params block, flat code/data segments, and CR0.PE only (no
/// paging; the kernel enters long mode itself).
pub fn setup_cpu_regs(vcpu: &VcpuFd) -> Result<(), BootError> {
    let mut sregs = vcpu.get_sregs()?;
    sregs.cs = flat_segment(true);
    sregs.ds = flat_segment(false);
    sregs.es = flat_segment(false);
    sregs.fs = flat_segment(false);
    sregs.gs = flat_segment(false);
    sregs.ss = flat_segment(false);
    sregs.cr0 |= 0x1; // PE
    sregs.cr0 &= !0x8000_0000; // ensure PG is clear
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rflags: 0x2,
        rip: layout::HIMEM_START,
        rsi: layout::BOOT_PARAMS_START,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_segment_is_full_address_space() {
        let seg = flat_segment(true);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.limit, 0xffff_ffff);
        assert_eq!(seg.g, 1);
    }
}

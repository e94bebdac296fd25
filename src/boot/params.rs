//! boot_params ("zero page") construction for the bzImage boot path.
//!
//! Field offsets and E820 entry shape follow the zero-page layout
//! directly; the fixed addresses and loadflags match the legacy 32-bit
//! entry this core hands the guest (RIP = 0x100000 exactly, no
//! long-mode setup performed here).

use super::bzimage::LoadedKernel;
use super::memory::GuestMemory;
use super::{layout, BootConfig, BootError};

const BOOT_PARAMS_SIZE: usize = 4096;

#[repr(u32)]
#[derive(Clone, Copy)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
}

mod offsets {
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_HEADER: usize = 0x1f1;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const HEAP_END_PTR: usize = 0x224;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_MAP: usize = 0x2d0;
}

/// Legacy PC memory-map boundaries used to build the E820 table.
mod region {
    pub const EBDA_START: u64 = 0x0009_fc00;
    pub const VGA_START: u64 = 0x000a_0000;
    pub const MB_BIOS_START: u64 = 0x000f_0000;
    pub const MB_BIOS_END: u64 = 0x0010_0000;
}

const LOADFLAGS_LOADED_HIGH: u8 = 0x01;
const LOADFLAGS_CAN_USE_HEAP: u8 = 0x80;
const LOADFLAGS_KEEP_SEGMENTS: u8 = 0x40;
const TYPE_OF_LOADER_UNDEFINED: u8 = 0xff;
const HEAP_END_PTR: u16 = 0xfe00;
const VID_MODE_NORMAL: u16 = 0xffff;

pub fn setup_boot_params(
    memory: &GuestMemory,
    config: &BootConfig,
    loaded_kernel: &LoadedKernel,
    initrd_len: Option<u32>,
) -> Result<(), BootError> {
    let mut params = [0u8; BOOT_PARAMS_SIZE];

    let header_len = loaded_kernel
        .setup_header
        .len()
        .min(BOOT_PARAMS_SIZE - offsets::SETUP_HEADER);
    params[offsets::SETUP_HEADER..offsets::SETUP_HEADER + header_len]
        .copy_from_slice(&loaded_kernel.setup_header[..header_len]);

    params[0x1fe..0x200].copy_from_slice(&VID_MODE_NORMAL.to_ne_bytes());
    params[offsets::TYPE_OF_LOADER] = TYPE_OF_LOADER_UNDEFINED;
    params[offsets::LOADFLAGS] |=
        LOADFLAGS_CAN_USE_HEAP | LOADFLAGS_LOADED_HIGH | LOADFLAGS_KEEP_SEGMENTS;

    if let Some(len) = initrd_len {
        params[offsets::RAMDISK_IMAGE..offsets::RAMDISK_IMAGE + 4]
            .copy_from_slice(&layout::INITRD_START.to_le_bytes()[..4]);
        params[offsets::RAMDISK_SIZE..offsets::RAMDISK_SIZE + 4].copy_from_slice(&len.to_le_bytes());
    }

    params[offsets::HEAP_END_PTR..offsets::HEAP_END_PTR + 2]
        .copy_from_slice(&HEAP_END_PTR.to_le_bytes());

    let cmd_line_ptr = (layout::CMDLINE_START as u32).to_le_bytes();
    params[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4].copy_from_slice(&cmd_line_ptr);
    let cmdline_size = (config.cmdline.len() as u32 + 1).to_le_bytes();
    params[offsets::CMDLINE_SIZE..offsets::CMDLINE_SIZE + 4].copy_from_slice(&cmdline_size);

    memory.write(layout::BOOT_PARAMS_START, &params)?;

    setup_cmdline(memory, &config.cmdline)?;

    let e820_entries = setup_e820_map(memory, config.mem_size)?;
    memory.write_u8(
        layout::BOOT_PARAMS_START + offsets::E820_ENTRIES as u64,
        e820_entries,
    )?;

    Ok(())
}

fn setup_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }
    memory.write(layout::CMDLINE_START, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE_START + cmdline.len() as u64, 0)?;
    Ok(())
}

/// Builds the four-entry E820 map spec'd for this core: usable RAM
/// below the EBDA, the EBDA/VGA/BIOS-ROM hole reserved, and usable RAM
/// from the 1 MiB mark to the end of guest memory.
fn setup_e820_map(memory: &GuestMemory, mem_size: u64) -> Result<u8, BootError> {
    let e820_addr = layout::BOOT_PARAMS_START + offsets::E820_MAP as u64;
    let entry_size = 20u64;
    let mut idx = 0u64;

    let mut write_entry = |base: u64, size: u64, ty: E820Type| -> Result<(), BootError> {
        write_e820_entry(memory, e820_addr + idx * entry_size, base, size, ty)?;
        idx += 1;
        Ok(())
    };

    write_entry(0x500, region::EBDA_START - 0x500, E820Type::Ram)?;
    write_entry(
        region::EBDA_START,
        region::VGA_START - region::EBDA_START,
        E820Type::Reserved,
    )?;
    write_entry(
        region::MB_BIOS_START,
        region::MB_BIOS_END - region::MB_BIOS_START,
        E820Type::Reserved,
    )?;
    write_entry(0x0010_0000, mem_size - 0x0010_0000, E820Type::Ram)?;

    Ok(idx as u8)
}

fn write_e820_entry(
    memory: &GuestMemory,
    addr: u64,
    base: u64,
    size: u64,
    type_: E820Type,
) -> Result<(), BootError> {
    memory.write_u64(addr, base)?;
    memory.write_u64(addr + 8, size)?;
    memory.write_u32(addr + 16, type_ as u32)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e820_regions_are_contiguous_and_ordered() {
        assert!(region::EBDA_START < region::VGA_START);
        assert!(region::VGA_START < region::MB_BIOS_START);
        assert_eq!(region::MB_BIOS_END, 0x0010_0000);
    }

    #[test]
    fn test_write_e820_entry_roundtrip() {
        let mem = GuestMemory::new(32 * 1024 * 1024).unwrap();
        write_e820_entry(&mem, 0x1000, 0x500, 0x1000, E820Type::Ram).unwrap();
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0x500);
        assert_eq!(mem.read_u64(0x1008).unwrap(), 0x1000);
        assert_eq!(mem.read_u32(0x1010).unwrap(), E820Type::Ram as u32);
    }
}

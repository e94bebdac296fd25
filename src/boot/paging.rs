//! 4-level identity page tables for the PVH boot path (2 MiB pages).
//!
//! Guests here can ask for more than 1 GiB of RAM, so the page
//! directory is sized to cover the whole configured memory instead of a
//! fixed 512 entries.

use super::layout;
use super::memory::GuestMemory;
use super::BootError;

pub const PML4_START: u64 = 0x0003_0000;
const PDPT_START: u64 = 0x0003_1000;
const PD_START: u64 = 0x0003_2000;

const PAGE_PRESENT_RW: u64 = 0x3;
const PAGE_PRESENT_RW_HUGE: u64 = 0x83;

const PAGE_TABLE_SIZE: u64 = 0x1000;
const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Builds identity-mapped page tables (virtual == physical) covering
/// `[0, mem_size)` using 2 MiB pages, sized to the guest's actual
/// memory instead of a fixed first gigabyte.
pub fn setup_identity_page_tables(memory: &GuestMemory) -> Result<(), BootError> {
    let mem_size = memory.size();
    let num_pd_tables = mem_size.div_ceil(GIB).max(1);

    memory.write_u64(PML4_START, PDPT_START | PAGE_PRESENT_RW)?;

    for pdpt_index in 0..num_pd_tables {
        let pd_base = PD_START + pdpt_index * PAGE_TABLE_SIZE;
        memory.write_u64(
            PDPT_START + pdpt_index * 8,
            pd_base | PAGE_PRESENT_RW,
        )?;

        let mut pd_table = [0u8; 4096];
        for entry_index in 0..512u64 {
            let page_phys = pdpt_index * GIB + entry_index * HUGE_PAGE_SIZE;
            if page_phys >= mem_size {
                break;
            }
            let entry = page_phys | PAGE_PRESENT_RW_HUGE;
            let offset = (entry_index * 8) as usize;
            pd_table[offset..offset + 8].copy_from_slice(&entry.to_le_bytes());
        }
        memory.write(pd_base, &pd_table)?;
    }

    Ok(())
}

/// GDT/IDT locations shared by both boot paths; only the PVH path
/// currently installs a GDT (bzImage hands the guest flat segments
/// directly without needing one in memory).
pub fn setup_gdt_idt(memory: &GuestMemory) -> Result<(), BootError> {
    memory.write_u64(layout::GDT_START, 0)?;
    memory.write_u64(layout::IDT_START, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_map_covers_more_than_one_gib() {
        let mem = GuestMemory::new(2 * 1024 * 1024 * 1024).unwrap();
        setup_identity_page_tables(&mem).unwrap();

        let pml4_entry = mem.read_u64(PML4_START).unwrap();
        assert_eq!(pml4_entry & PAGE_PRESENT_RW, PAGE_PRESENT_RW);

        let second_pdpt_entry = mem.read_u64(PDPT_START + 8).unwrap();
        assert_ne!(second_pdpt_entry, 0);
    }

    #[test]
    fn test_huge_page_entries_are_2mib_aligned() {
        let mem = GuestMemory::new(64 * 1024 * 1024).unwrap();
        setup_identity_page_tables(&mem).unwrap();
        let entry = mem.read_u64(PD_START + 8).unwrap();
        let phys = entry & 0x000f_ffff_ffe0_0000;
        assert_eq!(phys % HUGE_PAGE_SIZE, 0);
    }
}

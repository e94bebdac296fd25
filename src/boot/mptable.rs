//! MP (Multi-Processor) table construction for the EBDA-adjacent
//! address this core's fixed memory layout reserves for it.
//!
//! The MP Specification (Intel MP Spec 1.4) is the legacy mechanism for
//! telling the guest kernel how processors and the I/O APIC are wired
//! to legacy ISA IRQs, without needing to emulate full ACPI power
//! management.
//!
//! # Layout
//!
//! ```text
//! MPTABLE_START        MP Floating Pointer Structure (16 bytes)
//! MPTABLE_START + 16   MP Configuration Table header, then entries
//! ```

use super::memory::GuestMemory;
use super::BootError;

pub const MPTABLE_START: u64 = 0x000f_0000;

const LOCAL_APIC_ADDR: u32 = 0xfee0_0000;
const IO_APIC_ADDR: u32 = 0xfec0_0000;
const APIC_VERSION: u8 = 0x14;
const NUM_LEGACY_IRQS: u8 = 16;

const MP_SIGNATURE: [u8; 4] = *b"_MP_";
const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
const MP_SPEC_REVISION: u8 = 4;

const MP_PROCESSOR: u8 = 0;
const MP_BUS: u8 = 1;
const MP_IOAPIC: u8 = 2;
const MP_INTSRC: u8 = 3;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 0x01;
const CPU_BOOT: u8 = 0x02;
const CPU_STEPPING: u32 = 0x600;
const CPU_FEATURE_APIC: u32 = 0x200;
const CPU_FEATURE_FPU: u32 = 0x001;

const INT_TYPE_INT: u8 = 0;
const INT_TYPE_EXTINT: u8 = 3;
const INT_TYPE_NMI: u8 = 1;
const MP_IRQPOL_DEFAULT: u16 = 0;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpFloatingPointer {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    spec_rev: u8,
    checksum: u8,
    feature1: u8,
    feature2: u8,
    feature3: u8,
    feature4: u8,
    feature5: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpConfigTable {
    signature: [u8; 4],
    length: u16,
    spec_rev: u8,
    checksum: u8,
    oem_id: [u8; 8],
    product_id: [u8; 12],
    oem_table_ptr: u32,
    oem_table_size: u16,
    entry_count: u16,
    lapic_addr: u32,
    ext_table_length: u16,
    ext_table_checksum: u8,
    reserved: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpProcessorEntry {
    entry_type: u8,
    apic_id: u8,
    apic_version: u8,
    cpu_flags: u8,
    cpu_signature: u32,
    feature_flags: u32,
    reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpBusEntry {
    entry_type: u8,
    bus_id: u8,
    bus_type: [u8; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpIoApicEntry {
    entry_type: u8,
    apic_id: u8,
    apic_version: u8,
    flags: u8,
    apic_addr: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpIntSrcEntry {
    entry_type: u8,
    int_type: u8,
    int_flag: u16,
    src_bus_id: u8,
    src_bus_irq: u8,
    dst_apic_id: u8,
    dst_apic_irq: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpLocalIntSrcEntry {
    entry_type: u8,
    int_type: u8,
    int_flag: u16,
    src_bus_id: u8,
    src_bus_irq: u8,
    dst_apic_id: u8,
    dst_apic_lint: u8,
}

/// Copies a `#[repr(C, packed)]` table entry's bytes out, for appending
/// to the flat buffer that gets written to guest memory in one shot.
fn entry_bytes<T: Copy>(entry: &T) -> Vec<u8> {
    let ptr = entry as *const T as *const u8;
    // Safety: every entry type here is plain, packed, fixed-width data.
    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()) }.to_vec()
}

/// MP checksums require the sum of every byte in the structure to be
/// zero mod 256.
fn compute_checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

fn legacy_irq_entries(ioapic_id: u8) -> Vec<u8> {
    let mut bytes = Vec::new();
    for irq in 0..NUM_LEGACY_IRQS {
        bytes.extend(entry_bytes(&MpIntSrcEntry {
            entry_type: MP_INTSRC,
            int_type: INT_TYPE_INT,
            int_flag: MP_IRQPOL_DEFAULT,
            src_bus_id: 0,
            src_bus_irq: irq,
            dst_apic_id: ioapic_id,
            dst_apic_irq: irq,
        }));
    }
    bytes
}

fn local_interrupt_entries() -> Vec<u8> {
    let mut bytes = entry_bytes(&MpLocalIntSrcEntry {
        entry_type: MP_LINTSRC,
        int_type: INT_TYPE_EXTINT,
        int_flag: MP_IRQPOL_DEFAULT,
        src_bus_id: 0,
        src_bus_irq: 0,
        dst_apic_id: 0,
        dst_apic_lint: 0,
    });
    bytes.extend(entry_bytes(&MpLocalIntSrcEntry {
        entry_type: MP_LINTSRC,
        int_type: INT_TYPE_NMI,
        int_flag: MP_IRQPOL_DEFAULT,
        src_bus_id: 0,
        src_bus_irq: 0,
        dst_apic_id: 0xff,
        dst_apic_lint: 1,
    }));
    bytes
}

/// Builds the MP Floating Pointer and Configuration Table (one
/// processor entry per vCPU, one ISA bus, one I/O APIC, the 16 legacy
/// IRQ routes, and the ExtINT/NMI local interrupt sources) and writes
/// both into guest memory at [`MPTABLE_START`].
pub fn setup_mptable(memory: &GuestMemory, num_cpus: u8) -> Result<u64, BootError> {
    let ioapic_id = num_cpus;

    let mut entries = Vec::new();
    for cpu_id in 0..num_cpus {
        entries.extend(entry_bytes(&MpProcessorEntry {
            entry_type: MP_PROCESSOR,
            apic_id: cpu_id,
            apic_version: APIC_VERSION,
            cpu_flags: CPU_ENABLED | if cpu_id == 0 { CPU_BOOT } else { 0 },
            cpu_signature: CPU_STEPPING,
            feature_flags: CPU_FEATURE_APIC | CPU_FEATURE_FPU,
            reserved: [0; 2],
        }));
    }
    entries.extend(entry_bytes(&MpBusEntry {
        entry_type: MP_BUS,
        bus_id: 0,
        bus_type: *b"ISA   ",
    }));
    entries.extend(entry_bytes(&MpIoApicEntry {
        entry_type: MP_IOAPIC,
        apic_id: ioapic_id,
        apic_version: APIC_VERSION,
        flags: 1,
        apic_addr: IO_APIC_ADDR,
    }));
    entries.extend(legacy_irq_entries(ioapic_id));
    entries.extend(local_interrupt_entries());

    let entry_count = num_cpus as u16 + 2 + NUM_LEGACY_IRQS as u16 + 2;
    let header = MpConfigTable {
        signature: MPC_SIGNATURE,
        length: (std::mem::size_of::<MpConfigTable>() + entries.len()) as u16,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        oem_id: *b"EMBERVSR",
        product_id: *b"EMBERVISOR  ",
        oem_table_ptr: 0,
        oem_table_size: 0,
        entry_count,
        lapic_addr: LOCAL_APIC_ADDR,
        ext_table_length: 0,
        ext_table_checksum: 0,
        reserved: 0,
    };

    let mut table = entry_bytes(&header);
    table.extend(entries);
    table[7] = compute_checksum(&table);

    let fp_size = std::mem::size_of::<MpFloatingPointer>();
    let table_addr = MPTABLE_START + fp_size as u64;
    memory.write(table_addr, &table)?;

    let mut fp = MpFloatingPointer {
        signature: MP_SIGNATURE,
        physptr: table_addr as u32,
        length: 1,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        feature1: 0,
        feature2: 0,
        feature3: 0,
        feature4: 0,
        feature5: 0,
    };
    let mut fp_buffer = entry_bytes(&fp);
    fp_buffer[10] = compute_checksum(&fp_buffer);
    fp.checksum = fp_buffer[10];
    memory.write(MPTABLE_START, &entry_bytes(&fp))?;

    Ok(MPTABLE_START)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<MpFloatingPointer>(), 16);
        assert_eq!(core::mem::size_of::<MpProcessorEntry>(), 20);
        assert_eq!(core::mem::size_of::<MpBusEntry>(), 8);
        assert_eq!(core::mem::size_of::<MpIoApicEntry>(), 8);
        assert_eq!(core::mem::size_of::<MpIntSrcEntry>(), 8);
        assert_eq!(core::mem::size_of::<MpLocalIntSrcEntry>(), 8);
    }

    #[test]
    fn test_checksum() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let checksum = compute_checksum(&data);
        let sum: u8 = data
            .iter()
            .chain(std::iter::once(&checksum))
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_setup_mptable_entry_count_matches_cpus_and_irqs() {
        let mem = GuestMemory::new(4 * 1024 * 1024).unwrap();
        setup_mptable(&mem, 2).unwrap();

        let mut header_bytes = [0u8; 4];
        mem.read(MPTABLE_START + 16 + 16, &mut header_bytes).unwrap();
        let entry_count = u16::from_le_bytes([header_bytes[2], header_bytes[3]]);
        assert_eq!(entry_count, 2 + 2 + NUM_LEGACY_IRQS as u16 + 2);
    }
}

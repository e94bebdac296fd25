//! VM-level ioctl surface: memory slots, vCPU creation, CPUID
//! fabrication, clock, IRQ-chip/PIT2 state, dirty-page logging.

use super::{KvmError, VcpuFd};
use kvm_bindings::{
    kvm_clock_data, kvm_cpuid_entry2, kvm_irqchip, kvm_pit_config, kvm_pit_state2,
    kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY,
};

/// TSS and identity-map addresses Intel VT-x requires; both sit in the
/// unused hole above any realistic guest RAM size this core supports.
const TSS_ADDR: usize = 0xffff_d000;
const IDENTITY_MAP_ADDR: u64 = 0xffff_c000;

pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    supported_cpuid: CpuId,
    next_vcpu: u64,
}

impl VmFd {
    pub fn new(vm: kvm_ioctls::VmFd, supported_cpuid: CpuId) -> Result<Self, KvmError> {
        vm.set_tss_address(TSS_ADDR)
            .map_err(KvmError::SetTssAddress)?;
        vm.set_identity_map_address(IDENTITY_MAP_ADDR)
            .map_err(KvmError::SetIdentityMapAddress)?;
        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)?;

        Ok(Self {
            vm,
            supported_cpuid,
            next_vcpu: 0,
        })
    }

    /// Registers the single guest-RAM slot (slot 0, base 0).
    ///
    /// # Safety
    /// The caller must keep `userspace_addr` mapped and valid for as
    /// long as the VM exists, and must not register overlapping slots.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        log_dirty_pages: bool,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: if log_dirty_pages {
                kvm_bindings::KVM_MEM_LOG_DIRTY_PAGES
            } else {
                0
            },
        };
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Returns a little-endian bitmap, one bit per 4 KiB page in slot
    /// `slot`, of pages written since the log was last cleared.
    pub fn get_dirty_log(&self, slot: u32, memory_size: usize) -> Result<Vec<u64>, KvmError> {
        self.vm
            .get_dirty_log(slot, memory_size)
            .map_err(KvmError::GetDirtyLog)
    }

    pub fn get_clock(&self) -> Result<kvm_clock_data, KvmError> {
        self.vm.get_clock().map_err(KvmError::Clock)
    }

    pub fn set_clock(&self, clock: &kvm_clock_data) -> Result<(), KvmError> {
        self.vm.set_clock(clock).map_err(KvmError::Clock)
    }

    /// `chip_id`: 0 = master PIC, 1 = slave PIC, 2 = IOAPIC.
    pub fn get_irqchip(&self, chip_id: u32) -> Result<kvm_irqchip, KvmError> {
        let mut chip = kvm_irqchip {
            chip_id,
            ..Default::default()
        };
        self.vm
            .get_irqchip(&mut chip)
            .map_err(KvmError::IrqChipState)?;
        Ok(chip)
    }

    pub fn set_irqchip(&self, chip: &kvm_irqchip) -> Result<(), KvmError> {
        self.vm.set_irqchip(chip).map_err(KvmError::IrqChipState)
    }

    pub fn get_pit2(&self) -> Result<kvm_pit_state2, KvmError> {
        self.vm.get_pit2().map_err(KvmError::Pit2State)
    }

    pub fn set_pit2(&self, state: &kvm_pit_state2) -> Result<(), KvmError> {
        self.vm.set_pit2(state).map_err(KvmError::Pit2State)
    }

    /// Pulses an edge-triggered IRQ line: assert then deassert, so a
    /// missed transition can never leave the line stuck asserted.
    pub fn pulse_irq_line(&self, irq: u32) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(irq, true)
            .map_err(|e| KvmError::IrqLine(irq, e))?;
        self.vm
            .set_irq_line(irq, false)
            .map_err(|e| KvmError::IrqLine(irq, e))
    }

    /// Creates the next vCPU in sequence (0 is the boot processor) and
    /// installs CPUID entries rewritten with the KVM paravirt signature
    /// and, when available, the host's TSC frequency.
    pub fn create_vcpu(&mut self) -> Result<VcpuFd, KvmError> {
        let id = self.next_vcpu;
        let vcpu = self
            .vm
            .create_vcpu(id)
            .map_err(|e| KvmError::CreateVcpu(e, id))?;

        let tsc_khz = vcpu.get_tsc_khz().unwrap_or(0);
        let cpuid = self.build_cpuid(tsc_khz)?;
        vcpu.set_cpuid2(&cpuid).map_err(KvmError::SetCpuid)?;

        self.next_vcpu += 1;
        Ok(VcpuFd::new(vcpu, id))
    }

    /// Rewrites the supported CPUID set: sets the hypervisor bit in
    /// leaf 1, strips any pre-existing KVM leaves, installs the
    /// signature leaf (0x40000000), the paravirt feature leaf
    /// (0x40000001, with the performance-monitoring leaf intentionally
    /// left out), and, when known, the TSC-frequency leaf (0x40000010).
    fn build_cpuid(&self, tsc_khz: u32) -> Result<CpuId, KvmError> {
        let mut entries: Vec<kvm_cpuid_entry2> = self.supported_cpuid.as_slice().to_vec();

        for entry in &mut entries {
            if entry.function == 1 {
                entry.ecx |= 1 << 31;
            }
        }
        entries.retain(|e| e.function < 0x4000_0000 || e.function > 0x4000_00ff);

        entries.push(kvm_cpuid_entry2 {
            function: 0x4000_0000,
            index: 0,
            flags: 0,
            eax: 0x4000_0010,
            ebx: 0x4b4d_564b, // "KVMK"
            ecx: 0x564b_4d56, // "VMKV"
            edx: 0x0000_004d, // "M\0\0\0"
            ..Default::default()
        });

        const KVM_FEATURE_CLOCKSOURCE: u32 = 1 << 0;
        const KVM_FEATURE_NOP_IO_DELAY: u32 = 1 << 1;
        const KVM_FEATURE_CLOCKSOURCE2: u32 = 1 << 3;
        const KVM_FEATURE_ASYNC_PF: u32 = 1 << 4;
        const KVM_FEATURE_PV_EOI: u32 = 1 << 6;
        const KVM_FEATURE_PV_UNHALT: u32 = 1 << 7;
        const KVM_FEATURE_CLOCKSOURCE_STABLE_BIT: u32 = 1 << 24;

        entries.push(kvm_cpuid_entry2 {
            function: 0x4000_0001,
            index: 0,
            flags: 0,
            eax: KVM_FEATURE_CLOCKSOURCE
                | KVM_FEATURE_NOP_IO_DELAY
                | KVM_FEATURE_CLOCKSOURCE2
                | KVM_FEATURE_ASYNC_PF
                | KVM_FEATURE_PV_EOI
                | KVM_FEATURE_PV_UNHALT
                | KVM_FEATURE_CLOCKSOURCE_STABLE_BIT,
            ..Default::default()
        });

        if tsc_khz > 0 {
            entries.push(kvm_cpuid_entry2 {
                function: 0x4000_0010,
                index: 0,
                flags: 0,
                eax: tsc_khz,
                ..Default::default()
            });
        }

        CpuId::from_entries(&entries).map_err(|_| KvmError::SetCpuid(kvm_ioctls::Error::new(22)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tss_and_identity_map_addresses_are_distinct() {
        assert_ne!(TSS_ADDR as u64, IDENTITY_MAP_ADDR);
        assert!(TSS_ADDR > 0xffff_0000);
        assert!(IDENTITY_MAP_ADDR > 0xffff_0000);
    }
}

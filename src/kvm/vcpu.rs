//! Per-vCPU state access and the exit-dispatch primitive.
//!
//! `kvm-ioctls` already decodes the shared run area into a typed
//! `kvm_ioctls::VcpuExit`; this module re-shapes that into the exit
//! taxonomy the core's dispatch loop (`machine::Machine`) matches on,
//! and exposes the register/debug/event ioctls spec'd for snapshotting
//! and the single-step tracer.

use super::KvmError;
use kvm_bindings::{
    kvm_debugregs, kvm_fpu, kvm_guest_debug, kvm_lapic_state, kvm_mp_state, kvm_msr_entry,
    kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs, Msrs, KVM_GUESTDBG_ENABLE,
    KVM_GUESTDBG_SINGLESTEP,
};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Result of classifying one `run()` call, in the taxonomy the
/// dispatch loop understands.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// Guest IN: the handler must fill `data` with the response.
    IoIn { port: u16, data: &'a mut [u8] },
    /// Guest OUT: `data` is the value the guest wrote.
    IoOut { port: u16, data: &'a [u8] },
    MmioRead(u64, &'a mut [u8]),
    MmioWrite(u64, &'a [u8]),
    Hlt,
    Shutdown,
    InternalError,
    FailEntry(u64),
    SystemEvent(u32),
    /// Single-step/breakpoint exit; the tracer disassembles at RIP.
    Debug,
    /// Exit reason observed but intentionally unhandled (seen during
    /// early kernel init); the dispatch loop just re-enters.
    Intr,
    Unknown(&'static str),
}

pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
    id: u64,
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd, id: u64) -> Self {
        Self { vcpu, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    pub fn get_debug_regs(&self) -> Result<kvm_debugregs, KvmError> {
        self.vcpu.get_debug_regs().map_err(KvmError::DebugRegs)
    }

    pub fn set_debug_regs(&self, regs: &kvm_debugregs) -> Result<(), KvmError> {
        self.vcpu.set_debug_regs(regs).map_err(KvmError::DebugRegs)
    }

    pub fn get_xcrs(&self) -> Result<kvm_xcrs, KvmError> {
        self.vcpu.get_xcrs().map_err(KvmError::Xcrs)
    }

    pub fn set_xcrs(&self, xcrs: &kvm_xcrs) -> Result<(), KvmError> {
        self.vcpu.set_xcrs(xcrs).map_err(KvmError::Xcrs)
    }

    pub fn get_lapic(&self) -> Result<kvm_lapic_state, KvmError> {
        self.vcpu.get_lapic().map_err(KvmError::LocalApic)
    }

    pub fn set_lapic(&self, state: &kvm_lapic_state) -> Result<(), KvmError> {
        self.vcpu.set_lapic(state).map_err(KvmError::LocalApic)
    }

    pub fn get_vcpu_events(&self) -> Result<kvm_vcpu_events, KvmError> {
        self.vcpu.get_vcpu_events().map_err(KvmError::VcpuEvents)
    }

    pub fn set_vcpu_events(&self, events: &kvm_vcpu_events) -> Result<(), KvmError> {
        self.vcpu
            .set_vcpu_events(events)
            .map_err(KvmError::VcpuEvents)
    }

    pub fn get_mp_state(&self) -> Result<kvm_mp_state, KvmError> {
        self.vcpu.get_mp_state().map_err(KvmError::MpState)
    }

    pub fn set_mp_state(&self, state: &kvm_mp_state) -> Result<(), KvmError> {
        self.vcpu.set_mp_state(*state).map_err(KvmError::MpState)
    }

    /// Enables or disables single-step tracing. Must be called before
    /// every `run()`, not just once, since some exit paths clear it.
    pub fn set_single_step(&self, enabled: bool) -> Result<(), KvmError> {
        let debug = kvm_guest_debug {
            control: if enabled {
                KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
            } else {
                0
            },
            ..Default::default()
        };
        self.vcpu
            .set_guest_debug(&debug)
            .map_err(KvmError::GuestDebug)
    }

    /// Sets the immediate-exit flag so the next entry into the driver
    /// returns promptly; used to stop vCPU workers for migration.
    pub fn set_immediate_exit(&mut self, immediate: bool) {
        self.vcpu.set_kvm_immediate_exit(immediate as u8);
    }

    /// Installs the MSRs a freshly created vCPU needs before its first
    /// `run()`: SYSENTER/SYSCALL targets, KERNEL_GS_BASE, a zeroed TSC,
    /// fast-string operations, and a write-back MTRR default type.
    pub fn set_boot_msrs(&self) -> Result<(), KvmError> {
        let msr_entry = |index: u32, data: u64| kvm_msr_entry {
            index,
            data,
            ..Default::default()
        };

        let entries = vec![
            msr_entry(msr::IA32_SYSENTER_CS, 0),
            msr_entry(msr::IA32_SYSENTER_ESP, 0),
            msr_entry(msr::IA32_SYSENTER_EIP, 0),
            msr_entry(msr::STAR, 0),
            msr_entry(msr::CSTAR, 0),
            msr_entry(msr::KERNEL_GS_BASE, 0),
            msr_entry(msr::SYSCALL_MASK, 0),
            msr_entry(msr::LSTAR, 0),
            msr_entry(msr::IA32_TSC, 0),
            msr_entry(msr::IA32_MISC_ENABLE, msr::MISC_ENABLE_FAST_STRING),
            msr_entry(msr::MTRR_DEF_TYPE, (1 << 11) | 6),
        ];

        let msrs = Msrs::from_entries(&entries).expect("failed to build boot MSR list");
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        Ok(())
    }

    /// The MSR set carried across migration: the same list
    /// [`Self::set_boot_msrs`] installs, read back by index/value pair
    /// rather than by fixed struct layout so the wire format doesn't
    /// depend on `kvm_msr_entry`'s padding.
    const MIGRATABLE_MSRS: &'static [u32] = &[
        msr::IA32_SYSENTER_CS,
        msr::IA32_SYSENTER_ESP,
        msr::IA32_SYSENTER_EIP,
        msr::STAR,
        msr::CSTAR,
        msr::LSTAR,
        msr::SYSCALL_MASK,
        msr::KERNEL_GS_BASE,
        msr::IA32_TSC,
        msr::IA32_MISC_ENABLE,
        msr::MTRR_DEF_TYPE,
    ];

    pub fn get_msrs(&self) -> Result<Vec<(u32, u64)>, KvmError> {
        let entries: Vec<kvm_msr_entry> = Self::MIGRATABLE_MSRS
            .iter()
            .map(|&index| kvm_msr_entry {
                index,
                ..Default::default()
            })
            .collect();
        let mut msrs = Msrs::from_entries(&entries).expect("failed to build MSR query list");
        self.vcpu.get_msrs(&mut msrs).map_err(KvmError::GetMsrs)?;
        Ok(msrs.as_slice().iter().map(|e| (e.index, e.data)).collect())
    }

    pub fn set_msrs(&self, saved: &[(u32, u64)]) -> Result<(), KvmError> {
        let entries: Vec<kvm_msr_entry> = saved
            .iter()
            .map(|&(index, data)| kvm_msr_entry {
                index,
                data,
                ..Default::default()
            })
            .collect();
        let msrs = Msrs::from_entries(&entries).expect("failed to build MSR restore list");
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetMsrs)?;
        Ok(())
    }

    /// Enters the guest until the next exit and classifies it.
    pub fn run(&mut self) -> Result<VcpuExit<'_>, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => Ok(VcpuExit::IoIn { port, data }),
            KvmVcpuExit::IoOut(port, data) => Ok(VcpuExit::IoOut { port, data }),
            KvmVcpuExit::MmioRead(addr, data) => Ok(VcpuExit::MmioRead(addr, data)),
            KvmVcpuExit::MmioWrite(addr, data) => Ok(VcpuExit::MmioWrite(addr, data)),
            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Debug),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Intr),
            KvmVcpuExit::Intr => Ok(VcpuExit::Intr),
            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::S390Sieic => Ok(VcpuExit::Unknown("S390Sieic")),
            KvmVcpuExit::S390Reset => Ok(VcpuExit::Unknown("S390Reset")),
            KvmVcpuExit::Dcr => Ok(VcpuExit::Unknown("Dcr")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(VcpuExit::Unknown("Watchdog")),
            KvmVcpuExit::Epr => Ok(VcpuExit::Unknown("Epr")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}

//! Thin, typed wrapper over the host's hardware-virtualization ioctl
//! surface (`/dev/kvm`, or another path given on the command line, and
//! the VM/vCPU file descriptors it hands out).
//!
//! Every call here submits one ioctl; `EINTR` is retried transparently
//! by the underlying `kvm-ioctls` crate, and every other failure is
//! surfaced as a [`KvmError`] variant carrying the operation name and
//! the underlying errno.

mod vcpu;
mod vm;

pub use vcpu::{IoDirection, VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::{Cap, Kvm};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;

fn path_to_cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).expect("driver path must not contain NUL bytes")
}

#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open virt driver device: {0}")]
    OpenDriver(#[source] kvm_ioctls::Error),
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),
    #[error("failed to create vCPU {1}: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error, u64),
    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),
    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),
    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),
    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),
    #[error("failed to set identity map address: {0}")]
    SetIdentityMapAddress(#[source] kvm_ioctls::Error),
    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),
    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),
    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),
    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),
    #[error("failed to get MSRs: {0}")]
    GetMsrs(#[source] kvm_ioctls::Error),
    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),
    #[error("failed to get dirty log: {0}")]
    GetDirtyLog(#[source] kvm_ioctls::Error),
    #[error("failed to access VM clock: {0}")]
    Clock(#[source] kvm_ioctls::Error),
    #[error("failed to access IRQ chip state: {0}")]
    IrqChipState(#[source] kvm_ioctls::Error),
    #[error("failed to access PIT2 state: {0}")]
    Pit2State(#[source] kvm_ioctls::Error),
    #[error("failed to pulse IRQ line {0}: {1}")]
    IrqLine(u32, #[source] kvm_ioctls::Error),
    #[error("failed to toggle single-step: {0}")]
    GuestDebug(#[source] kvm_ioctls::Error),
    #[error("failed to read debug registers: {0}")]
    DebugRegs(#[source] kvm_ioctls::Error),
    #[error("failed to read extended control registers: {0}")]
    Xcrs(#[source] kvm_ioctls::Error),
    #[error("failed to read local APIC state: {0}")]
    LocalApic(#[source] kvm_ioctls::Error),
    #[error("failed to read vCPU events: {0}")]
    VcpuEvents(#[source] kvm_ioctls::Error),
    #[error("failed to read MP state: {0}")]
    MpState(#[source] kvm_ioctls::Error),
    #[error("bad vCPU index {0}")]
    BadCpu(usize),
}

/// Capabilities the core depends on; reported by name to the `probe`
/// subcommand and also checked (best-effort) before `create_vm` wires
/// up the VM.
pub const REQUIRED_EXTENSIONS: &[(&str, Cap)] = &[
    ("user memory", Cap::UserMemory),
    ("in-kernel irqchip", Cap::Irqchip),
    ("immediate exit", Cap::ImmediateExit),
    ("identity map address", Cap::SetIdentityMapAddr),
    ("adjust clock", Cap::AdjustClock),
];

pub struct ProbeReport {
    pub api_version: i32,
    pub extensions: Vec<(&'static str, bool)>,
}

/// Opens the virt driver and runs the extension checks the core
/// depends on, without creating a VM. Backs the `probe` subcommand.
pub fn probe(driver_path: &Path) -> Result<ProbeReport, KvmError> {
    let kvm = Kvm::new_with_path(path_to_cstring(driver_path)).map_err(KvmError::OpenDriver)?;
    let api_version = kvm.get_api_version();
    let extensions = REQUIRED_EXTENSIONS
        .iter()
        .map(|(name, cap)| (*name, kvm.check_extension(*cap)))
        .collect();
    Ok(ProbeReport {
        api_version,
        extensions,
    })
}

/// Opens the virt driver, fetches the supported CPUID set, and creates
/// a VM with the core's required components initialized (TSS, identity
/// map, in-kernel IRQ chip, PIT2).
pub fn create_vm(driver_path: &Path) -> Result<VmFd, KvmError> {
    let kvm = Kvm::new_with_path(path_to_cstring(driver_path)).map_err(KvmError::OpenDriver)?;
    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    VmFd::new(vm, supported_cpuid)
}

/// Narrows `VmFd` down to the one operation devices need from a
/// separate worker thread: pulsing an edge-triggered IRQ line. Lets
/// `Serial`/`VirtioBlk`/`VirtioNet` take `Arc<dyn IrqLine>` instead of
/// `Arc<VmFd>`, so their unit tests don't need a real `/dev/kvm`.
pub trait IrqLine: Send + Sync {
    fn pulse(&self, irq: u32);
}

impl IrqLine for VmFd {
    fn pulse(&self, irq: u32) {
        if let Err(e) = self.pulse_irq_line(irq) {
            tracing::warn!(irq, error = %e, "failed to pulse IRQ line");
        }
    }
}

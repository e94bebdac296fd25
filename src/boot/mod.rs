//! Boot image loading: places kernel, initrd, command line, boot
//! parameters, the E820 map, EBDA/MP table, and (PVH only) 4-level page
//! tables into guest physical memory at the fixed offsets below, then
//! initializes vCPU registers for the kernel handoff.
//!
//! Two entry protocols are supported, auto-detected from the kernel
//! image: the legacy 32-bit bzImage protocol (flat segments, CR0.PE
//! only, RIP exactly at the load address) and the PVH ELF-note direct
//! boot (64-bit long mode, identity page tables).

mod bzimage;
mod memory;
mod mptable;
mod paging;
mod params;
mod pvh;

pub use memory::GuestMemory;
pub use mptable::setup_mptable;

use std::path::Path;

use thiserror::Error;

use crate::kvm::{KvmError, VcpuFd};

pub mod layout {
    pub const GDT_START: u64 = 0x500;
    pub const IDT_START: u64 = 0x520;
    /// boot parameter block (bzImage) or zeroPage (PVH).
    pub const BOOT_PARAMS_START: u64 = 0x0001_0000;
    /// Kernel command line (NUL terminated).
    pub const CMDLINE_START: u64 = 0x0002_0000;
    pub const CMDLINE_MAX_SIZE: usize = 2048;
    /// 64-bit kernel image load address.
    pub const HIMEM_START: u64 = 0x0010_0000;
    /// initrd load address.
    pub const INITRD_START: u64 = 0x0f00_0000;

    pub const DEFAULT_MEM_SIZE: u64 = 512 * 1024 * 1024;
}

#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),
    #[error(transparent)]
    Kvm(#[from] KvmError),
    #[error("failed to read kernel: {0}")]
    ReadKernel(#[source] std::io::Error),
    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),
    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },
}

pub struct BootConfig {
    pub kernel_path: std::path::PathBuf,
    pub initrd_path: Option<std::path::PathBuf>,
    pub cmdline: String,
    pub mem_size: u64,
}

/// Loads the kernel (and optional initrd) into guest memory, builds
/// boot_params/E820/EBDA+MP table, and returns the vCPU register setup
/// closure's inputs; callers then call [`setup_vcpu_regs`] once per
/// vCPU.
pub enum LoadedImage {
    BzImage(bzimage::LoadedKernel),
    Pvh(pvh::PvhKernel),
}

pub fn setup_boot(
    memory: &GuestMemory,
    config: &BootConfig,
    num_cpus: u8,
) -> Result<LoadedImage, BootError> {
    setup_mptable(memory, num_cpus)?;

    let initrd_len = match &config.initrd_path {
        Some(path) => Some(bzimage::load_initrd(memory, path)?),
        None => None,
    };

    if bzimage::is_elf(&config.kernel_path)? {
        let kernel = pvh::load_kernel(memory, &config.kernel_path)?;
        Ok(LoadedImage::Pvh(kernel))
    } else {
        let loaded = bzimage::load_kernel(memory, &config.kernel_path)?;
        params::setup_boot_params(memory, config, &loaded, initrd_len)?;
        Ok(LoadedImage::BzImage(loaded))
    }
}

pub fn setup_vcpu_regs(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    image: &LoadedImage,
) -> Result<(), BootError> {
    match image {
        LoadedImage::BzImage(_) => bzimage::setup_cpu_regs(vcpu),
        LoadedImage::Pvh(kernel) => pvh::setup_cpu_regs(vcpu, memory, kernel),
    }
}

pub fn kernel_path_exists(path: &Path) -> bool {
    path.is_file()
}

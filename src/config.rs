//! Command-line surface: two subcommands, `boot` and `probe`.
//!
//! `Cli` is the raw clap-derive parse target; `VmConfig` is the
//! validated form `Vmm::setup` actually consumes. Validation (path
//! existence, vCPU bounds) happens at `Setup`, not at parse time,
//! keeping argument parsing in `main.rs` separate from VM construction
//! in `run()`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "embervisor")]
#[command(about = "A Type-2 x86_64 hypervisor built on KVM")]
pub struct Cli {
    /// Increase logging verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot a guest kernel.
    Boot(BootArgs),
    /// Probe the host's virtualization capabilities and exit.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BootArgs {
    /// Path to the virt driver device node (e.g. /dev/kvm).
    #[arg(short = 'D', long = "driver", default_value = "/dev/kvm")]
    pub driver: PathBuf,

    /// Path to the guest kernel (bzImage or PVH ELF).
    #[arg(short = 'k', long = "kernel")]
    pub kernel: PathBuf,

    /// Path to the initrd image.
    #[arg(short = 'i', long = "initrd")]
    pub initrd: Option<PathBuf>,

    /// Kernel command line.
    #[arg(short = 'p', long = "params", default_value = "console=ttyS0 reboot=k panic=1")]
    pub cmdline: String,

    /// TAP interface name for virtio-net; empty disables networking.
    #[arg(short = 't', long = "tap", default_value = "")]
    pub tap: String,

    /// Backing file for virtio-blk; empty disables the disk.
    #[arg(short = 'd', long = "disk", default_value = "")]
    pub disk: String,

    /// Number of vCPUs.
    #[arg(short = 'c', long = "cpus", default_value_t = 1)]
    pub cpus: u8,

    /// Guest memory size; accepts an optional G/M/K suffix (default unit G).
    #[arg(short = 'm', long = "memory", default_value = "1G")]
    pub memory: String,

    /// Skip count before enabling single-step tracing (0 = off).
    #[arg(short = 'T', long = "trace", default_value_t = 0)]
    pub trace_skip: u64,

    /// Runs as a migration destination, listening on "host:port" for
    /// the incoming Snapshot/MemoryFull/MemoryDirty stream instead of
    /// loading a kernel.
    #[arg(long = "migrate-dest")]
    pub migrate_dest: Option<String>,

    /// Unix socket path accepting a single newline-terminated
    /// `MIGRATE host:port\n` command that triggers source-side
    /// migration.
    #[arg(long = "control-socket")]
    pub control_socket: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Path to the virt driver device node (e.g. /dev/kvm).
    #[arg(short = 'D', long = "driver", default_value = "/dev/kvm")]
    pub driver: PathBuf,
}

/// Validated, ready-to-use VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub driver: PathBuf,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    pub tap: Option<String>,
    pub disk: Option<String>,
    pub cpus: u8,
    pub mem_size: u64,
    pub trace_skip: u64,
    pub migrate_dest: Option<String>,
    pub control_socket: Option<PathBuf>,
}

impl VmConfig {
    pub fn from_args(args: &BootArgs) -> crate::error::Result<Self> {
        if args.cpus == 0 {
            return Err(crate::error::Error::Config("cpu count must be >= 1".into()));
        }
        let mem_size = parse_memory_size(&args.memory)?;
        Ok(VmConfig {
            driver: args.driver.clone(),
            kernel: args.kernel.clone(),
            initrd: args.initrd.clone(),
            cmdline: args.cmdline.clone(),
            tap: (!args.tap.is_empty()).then(|| args.tap.clone()),
            disk: (!args.disk.is_empty()).then(|| args.disk.clone()),
            cpus: args.cpus,
            mem_size,
            trace_skip: args.trace_skip,
            migrate_dest: args.migrate_dest.clone(),
            control_socket: args.control_socket.clone(),
        })
    }
}

/// Parses a memory size string with an optional `G`/`M`/`K` suffix
/// (case-insensitive). A bare number is interpreted in gigabytes.
pub fn parse_memory_size(s: &str) -> crate::error::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::error::Error::Config("empty memory size".into()));
    }
    let (digits, multiplier) = match s.chars().last().unwrap().to_ascii_uppercase() {
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'K' => (&s[..s.len() - 1], 1024),
        _ => (s, 1024 * 1024 * 1024),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| crate::error::Error::Config(format!("invalid memory size: {s}")))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_plain_gigabytes() {
        assert_eq!(parse_memory_size("2").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("1g").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory_size("banana").is_err());
        assert!(parse_memory_size("").is_err());
    }
}

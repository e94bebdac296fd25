//! Crate-level error aggregation.
//!
//! Each component defines its own `thiserror` enum; this type wraps them
//! for the top-level `Result` returned by `main` and by `Vmm`. The
//! component variants only exist on Linux, since that's the only
//! platform the components themselves are compiled on; `Config`/`Io`
//! stay available everywhere so `config.rs`'s validation can run on
//! any host even though it can never reach a real VM there.

#[cfg(target_os = "linux")]
use crate::boot::BootError;
#[cfg(target_os = "linux")]
use crate::devices::virtio::VirtioError;
#[cfg(target_os = "linux")]
use crate::kvm::KvmError;
#[cfg(target_os = "linux")]
use crate::machine::MachineError;
#[cfg(target_os = "linux")]
use crate::migration::MigrationError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Boot(#[from] BootError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Virtio(#[from] VirtioError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

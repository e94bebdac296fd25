//! embervisor - a lightweight Type-2 x86_64 hypervisor built on KVM.
//!
//! This binary only parses arguments and dispatches to [`vmm::Vmm`] (or
//! the `probe` subcommand); the hypervisor itself lives in the library
//! modules below. Requires Linux with KVM support.

mod config;
mod error;
mod logging;

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod ioport;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod machine;
#[cfg(target_os = "linux")]
mod migration;
#[cfg(target_os = "linux")]
mod trace;
#[cfg(target_os = "linux")]
mod vmm;

use std::process::ExitCode;

use clap::Parser;

use config::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli.command) {
        tracing::error!(error = %e, "exiting with error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(command: Command) -> error::Result<()> {
    match command {
        Command::Boot(args) => {
            let config = config::VmConfig::from_args(&args)?;
            let vmm = vmm::Vmm::new(config)?;
            vmm.run()
        }
        Command::Probe(args) => {
            let report = kvm::probe(&args.driver)?;
            println!("virt driver API version: {}", report.api_version);
            for (name, supported) in report.extensions {
                println!("  {name}: {}", if supported { "yes" } else { "no" });
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_command: Command) -> error::Result<()> {
    Err(error::Error::Config(
        "embervisor requires Linux with KVM support; this platform is not supported".into(),
    ))
}

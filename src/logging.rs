//! Tracing subscriber setup.
//!
//! The CLI's repeated `-v` flag raises the default filter the way the
//! count of `--verbose` occurrences used to raise `eprintln!` chattiness
//! in earlier iterations of this runtime; now it drives a `tracing`
//! `EnvFilter` instead, with `RUST_LOG` taking precedence when set.

use tracing_subscriber::EnvFilter;

pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

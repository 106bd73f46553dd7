//! Shared plumbing for the CLI binaries.

use rcpdb_core::error::Error;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// 0 success, 2 configuration error, 3 I/O error, 4 cancelled, 5 internal.
pub fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Config(_) => 2,
        Error::NotFound(_) | Error::IndexCorrupt(_) | Error::External(_) | Error::Timeout(_) => 3,
        Error::Cancelled => 4,
        Error::Parse(_) | Error::Internal(_) => 5,
    }
}

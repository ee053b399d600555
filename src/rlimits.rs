//! Startup resource limits. `NPROC` is kept at its exact value rather than
//! rounded or derived from the running kernel.

use std::fs;

use nix::sys::resource::{setrlimit, Resource};
use tracing::warn;

const NOFILE_LIMIT: u64 = 1_000_000;
const NPROC_LIMIT: u64 = 30_604;
const SIGPENDING_LIMIT: u64 = 30_604;

pub fn apply() -> crate::error::Result<()> {
    setrlimit(Resource::RLIMIT_NOFILE, NOFILE_LIMIT, NOFILE_LIMIT)?;
    setrlimit(Resource::RLIMIT_NPROC, NPROC_LIMIT, NPROC_LIMIT)?;
    setrlimit(Resource::RLIMIT_SIGPENDING, SIGPENDING_LIMIT, SIGPENDING_LIMIT)?;

    if let Err(e) = fs::write("/proc/sys/fs/file-max", NOFILE_LIMIT.to_string()) {
        warn!(error = %e, "failed to raise /proc/sys/fs/file-max");
    }

    Ok(())
}

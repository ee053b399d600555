//! Signal & reaper: termination sweep used by
//! STOPPOD/DESTROYPOD. Reaping itself happens through the ordinary
//! pidfd-readiness path (`pidfd.rs`) alongside every other exec; this
//! module only owns sending the signals in the right order.

use std::fs;
use std::time::Duration;

use nix::sys::signal::{kill as nix_kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::Registry;

/// `SigIgn:` bit position for SIGTERM (signal 15) in `/proc/<pid>/status`;
/// bit N-1 for signal N, per the kernel's `proc(5)` bitmask convention.
const SIGTERM_BIT: u64 = 1 << (Signal::SIGTERM as u64 - 1);

fn ignores_sigterm(pid: i32) -> bool {
    let status = match fs::read_to_string(format!("/proc/{pid}/status")) {
        Ok(s) => s,
        Err(_) => return false,
    };
    for line in status.lines() {
        if let Some(hex) = line.strip_prefix("SigIgn:") {
            if let Ok(mask) = u64::from_str_radix(hex.trim(), 16) {
                return mask & SIGTERM_BIT != 0;
            }
        }
    }
    false
}

/// Sends SIGTERM to one pid, upgrading to SIGKILL immediately if it has
/// SIGTERM in its `SigIgn` mask -- used both for
/// tracked execs and for the sandbox init itself, which isn't in the exec
/// registry but still needs signaling on `StopPod`/`DestroyPod`.
pub fn signal_pid(pid: i32) {
    let signal = if ignores_sigterm(pid) {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    debug!(pid, ?signal, "terminating process");
    if let Err(e) = nix_kill(Pid::from_raw(pid), signal) {
        warn!(pid, error = %e, "failed to signal process");
    }
}

/// Sends SIGTERM to every tracked exec still running, upgrading to SIGKILL
/// immediately for any that have it in their `SigIgn` mask -- these would
/// otherwise linger past the grace period for no useful reason.
pub fn signal_live_execs(registry: &Registry) -> Result<()> {
    for pid in registry.live_pids() {
        signal_pid(pid);
    }
    Ok(())
}

/// Walks every pid in `/proc` except agent pid 1 and applies `signal`,
/// skipping kthreads (no `exe` link). Shared by the opening broadcast
/// SIGTERM and the final SIGKILL sweep -- both need to reach untracked
/// grandchildren the exec'd commands spawned themselves, not just what's in
/// the registry.
fn broadcast_signal(signal: Signal) {
    let entries = match fs::read_dir("/proc") {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "failed to read /proc for signal broadcast");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == 1 {
            continue;
        }
        if fs::read_link(format!("/proc/{pid}/exe")).is_err() {
            continue;
        }
        let _ = nix_kill(Pid::from_raw(pid), signal);
    }
}

/// Opening broadcast for `StopPod`/`DestroyPod`: SIGTERMs every pid in
/// `/proc` (except pid 1) before the tracked-process SigIgn upgrade runs, so
/// grandchildren the registry doesn't know about also get a chance to exit
/// cleanly during the grace period.
pub fn broadcast_sigterm_sweep() {
    broadcast_signal(Signal::SIGTERM);
}

/// Final best-effort sweep: walks `/proc` and `SIGKILL`s anything still
/// alive except agent pid 1.
pub fn broadcast_sigkill_sweep() {
    broadcast_signal(Signal::SIGKILL);
}

/// Default grace period between SIGTERM and the final SIGKILL sweep.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigterm_bit_matches_signal_number() {
        // SIGTERM is signal 15; proc(5) bit 14 (0-indexed) == 1<<14.
        assert_eq!(SIGTERM_BIT, 1 << 14);
    }
}

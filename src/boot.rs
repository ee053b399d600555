//! One-shot early filesystem setup the agent performs as PID 1, before the
//! reactor starts. Platform boot glue is out of the core's scope as a
//! *responsibility*, but something has to run it once,
//! since this binary has nothing above it in the init hierarchy.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use tracing::{info, warn};

use crate::error::Result;

const STANDARD_SYMLINKS: &[(&str, &str)] = &[
    ("/bin/busybox", "/sh"),
    ("/bin/busybox", "/tar"),
    ("/sbin/busybox", "/sbin/modprobe"),
    ("/sbin/busybox", "/sbin/depmod"),
    ("/sbin/busybox", "/sbin/iptables"),
];

fn mount_pseudo_fs(target: &str, fstype: &str, flags: MsFlags) {
    if let Err(e) = fs::create_dir_all(target) {
        warn!(error = %e, target, "failed to create mount point");
    }
    match mount(Some(fstype), target, Some(fstype), flags, None::<&str>) {
        Ok(()) => info!(target, fstype, "mounted"),
        Err(nix::errno::Errno::EBUSY) => {} // already mounted, fine
        Err(e) => warn!(error = %e, target, fstype, "mount failed"),
    }
}

/// Mounts the pseudo-filesystems the rest of the agent assumes are present,
/// and lays down the standard symlink scaffolding.
pub fn early_setup() -> Result<()> {
    mount_pseudo_fs("/proc", "proc", MsFlags::empty());
    mount_pseudo_fs("/sys", "sysfs", MsFlags::empty());
    mount_pseudo_fs(
        "/dev",
        "devtmpfs",
        MsFlags::MS_NOSUID,
    );
    mount_pseudo_fs(
        "/dev/pts",
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
    );

    for (src, link) in STANDARD_SYMLINKS {
        if Path::new(src).exists() && !Path::new(link).exists() {
            if let Err(e) = std::os::unix::fs::symlink(src, link) {
                warn!(error = %e, src, link, "failed to create symlink");
            }
        }
    }

    std::env::set_var(
        "PATH",
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    );

    sync_clock_from_hwclock();

    Ok(())
}

/// Steps the system clock from the hardware RTC once, since a
/// freshly-booted guest kernel's clock may be stale relative to the host.
fn sync_clock_from_hwclock() {
    let rtc = match fs::File::open("/dev/rtc0") {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "no /dev/rtc0, skipping clock sync");
            return;
        }
    };

    let mut rtc_time = nix::libc::tm {
        tm_sec: 0,
        tm_min: 0,
        tm_hour: 0,
        tm_mday: 0,
        tm_mon: 0,
        tm_year: 0,
        tm_wday: 0,
        tm_yday: 0,
        tm_isdst: 0,
        tm_gmtoff: 0,
        tm_zone: std::ptr::null_mut(),
    };

    const RTC_RD_TIME: u64 = 0x80247009;
    let res = unsafe {
        nix::libc::ioctl(rtc.as_raw_fd(), RTC_RD_TIME as _, &mut rtc_time as *mut _)
    };
    if res != 0 {
        warn!("RTC_RD_TIME ioctl failed, skipping clock sync");
        return;
    }

    let epoch = unsafe { nix::libc::timegm(&mut rtc_time as *mut _) };
    if epoch <= 0 {
        return;
    }
    let new_time = nix::libc::timeval {
        tv_sec: epoch as _,
        tv_usec: 0,
    };
    let res = unsafe { nix::libc::settimeofday(&new_time, std::ptr::null()) };
    if res != 0 {
        warn!("settimeofday failed, skipping clock sync");
    } else {
        info!("system clock synced from hardware RTC");
    }
}

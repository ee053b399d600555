//! `pidfd`-based process readiness, used in place of a process-wide
//! `SIGCHLD` handler: every tracked child gets a pollable fd, and reaping
//! happens as an ordinary reactor event instead of inside a signal handler.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::libc::{syscall, SYS_pidfd_open};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use tokio::io::unix::AsyncFd;

pub struct PidFd(AsyncFd<OwnedFd>);

impl PidFd {
    pub fn open(pid: i32) -> std::io::Result<Self> {
        // PIDFD_NONBLOCK isn't exposed by the libc binding on all targets;
        // request it by raw value (1) so a fresh fd doesn't block epoll.
        const PIDFD_NONBLOCK: u32 = 1;
        let fd = unsafe { syscall(SYS_pidfd_open, pid, PIDFD_NONBLOCK) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        let fd = AsyncFd::new(fd)?;
        Ok(Self(fd))
    }

    /// Waits for the process to become reapable, then reaps it.
    ///
    /// Resolves once the kernel marks the pidfd readable, which for a
    /// `pidfd` only happens on exit; the subsequent `waitid` is therefore
    /// non-blocking by construction.
    pub async fn wait(&self) -> std::io::Result<WaitStatus> {
        loop {
            let mut guard = self.0.readable().await?;
            let borrowed: BorrowedFd<'_> = self.0.get_ref().as_fd();
            match waitid(Id::PIDFd(borrowed), WaitPidFlag::WEXITED) {
                Ok(status) => return Ok(status),
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(std::io::Error::from(e)),
            }
        }
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.get_ref().as_raw_fd()
    }
}

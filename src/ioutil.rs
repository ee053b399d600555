//! Small non-blocking read/write helpers shared by the control and tty
//! channel readers/writers, so each only has to own its
//! own framing and buffering logic.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::error::{AgentError, Result};

/// Reads once into `buf` once the fd is readable, returning the number of
/// bytes read (`0` means EOF).
pub async fn read_once(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> Result<usize> {
    loop {
        let mut guard = fd.readable().await.map_err(AgentError::Io)?;
        let res = guard
            .try_io(|fd| nix::unistd::read(fd.get_ref(), buf).map_err(std::io::Error::from));
        match res {
            Ok(inner) => return inner.map_err(AgentError::Io),
            Err(_would_block) => continue,
        }
    }
}

/// Writes all of `bytes`, looping over writable-readiness until done.
pub async fn write_all(fd: &AsyncFd<OwnedFd>, bytes: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let mut guard = fd.writable().await.map_err(AgentError::Io)?;
        let res = guard.try_io(|fd| {
            nix::unistd::write(fd, &bytes[offset..]).map_err(std::io::Error::from)
        });
        match res {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(AgentError::Io(e)),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Best-effort, single attempt, non-blocking write: used for exec stdin,
/// where a full buffer should drop the remainder rather than block the
/// central reactor loop.
pub fn try_write_once(fd: &AsyncFd<OwnedFd>, bytes: &[u8]) -> Result<usize> {
    let raw = fd.get_ref().as_raw_fd();
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    match nix::unistd::write(borrowed, bytes) {
        Ok(n) => Ok(n),
        Err(nix::errno::Errno::EAGAIN) => Ok(0),
        Err(e) => Err(AgentError::Os(e)),
    }
}

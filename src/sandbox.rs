//! The sandbox builder: creates the long-lived "pod
//! init" process owning fresh PID/MNT/IPC/UTS namespaces, and re-enters
//! those namespaces for later execs.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

use nix::mount::{mount, MsFlags};
use nix::sched::{clone, setns, CloneFlags};
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, pipe, read, sethostname, write, ForkResult, Pid};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::pidfd::PidFd;

const SANDBOX_STACK_SIZE: usize = 1024 * 1024;

/// File descriptors into a running sandbox's namespaces, used to re-enter
/// it from later `EXECCMD`/`NEWCONTAINER` handlers.
pub struct NsHandles {
    pub pid: OwnedFd,
    pub uts: OwnedFd,
    pub ipc: OwnedFd,
}

pub struct Sandbox {
    pub init_pid: i32,
    pub pidfd: PidFd,
    pub ns: NsHandles,
}

/// What the reactor keeps around after handing the sandbox's `PidFd` off to
/// [`crate::reactor::Agent::track_exit`] -- the pidfd itself has no further
/// use once its reap-wait future owns it.
pub struct SandboxHandle {
    pub init_pid: i32,
    pub ns: NsHandles,
}

fn open_ns_fd(pid: i32, ns: &str) -> Result<OwnedFd> {
    let path = format!("/proc/{pid}/ns/{ns}");
    let file = std::fs::File::open(&path).map_err(AgentError::Io)?;
    Ok(OwnedFd::from(file))
}

/// Body of the sandbox's own init process.
/// Has no Tokio runtime of its own: it is a tiny, single-purpose leaf that
/// only needs to stay alive as PID 1 of its new namespace and reap its
/// children, so it keeps the classic signal-handling idiom rather than the
/// pidfd-based redesign the rest of the agent uses (it cannot `pidfd_open`
/// itself from the outside).
extern "C" fn sandbox_init_body(arg: *mut nix::libc::c_void) -> i32 {
    let ctx = unsafe { Box::from_raw(arg as *mut SandboxInitCtx) };
    match run_sandbox_init(&ctx) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("sandbox init failed: {e}");
            1
        }
    }
}

struct SandboxInitCtx {
    hostname: String,
    ready_write: OwnedFd,
    inherited_fds_to_close: Vec<RawFd>,
}

fn run_sandbox_init(ctx: &SandboxInitCtx) -> Result<()> {
    for fd in &ctx.inherited_fds_to_close {
        let _ = nix::unistd::close(*fd);
    }

    extern "C" fn reap_only_handler(_: nix::libc::c_int) {
        loop {
            match nix::sys::wait::waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG),
            ) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
    unsafe {
        signal::sigaction(
            Signal::SIGCHLD,
            &signal::SigAction::new(
                SigHandler::Handler(reap_only_handler),
                signal::SaFlags::SA_RESTART,
                SigSet::empty(),
            ),
        )?;
    }
    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGCHLD);
    unblock.thread_unblock()?;

    let _ = std::fs::create_dir_all("/proc");
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .ok();

    sethostname(&ctx.hostname)?;

    write(&ctx.ready_write, &[1u8])?;

    let mut wait_mask = SigSet::all();
    wait_mask.remove(Signal::SIGCHLD);
    loop {
        let _ = wait_mask.suspend();
    }
}

/// Starts the sandbox: forks into fresh PID/MNT/IPC/UTS namespaces and
/// waits for the child's READY signal on a pipe.
pub fn start(hostname: &str, inherited_fds_to_close: Vec<RawFd>) -> Result<Sandbox> {
    let (ready_read, ready_write) = pipe().map_err(AgentError::Os)?;

    let ctx = Box::new(SandboxInitCtx {
        hostname: hostname.to_string(),
        ready_write,
        inherited_fds_to_close,
    });
    let ctx_ptr = Box::into_raw(ctx) as *mut nix::libc::c_void;

    let mut stack = vec![0u8; SANDBOX_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;

    // SIGCHLD as the clone "exit signal" so the agent can still reap this
    // process through the ordinary pidfd path once it exits.
    let child_pid = unsafe {
        clone(
            Box::new(move || sandbox_init_body(ctx_ptr) as isize),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as i32),
        )
        .map_err(AgentError::Os)?
    };

    let mut buf = [0u8; 1];
    match read(ready_read.as_fd(), &mut buf) {
        Ok(1) if buf[0] == 1 => {}
        _ => {
            warn!("sandbox did not signal READY");
            return Err(AgentError::Os(nix::errno::Errno::EIO));
        }
    }

    let pid = child_pid.as_raw();
    info!(pid, "sandbox init ready");

    let pidfd = PidFd::open(pid).map_err(AgentError::Io)?;
    let ns = NsHandles {
        pid: open_ns_fd(pid, "pid")?,
        uts: open_ns_fd(pid, "uts")?,
        ipc: open_ns_fd(pid, "ipc")?,
    };

    Ok(Sandbox {
        init_pid: pid,
        pidfd,
        ns,
    })
}

fn read_exact_pipe(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd, &mut buf[filled..]) {
            Ok(0) => return Err(AgentError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))),
            Ok(n) => filled += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(AgentError::Os(e)),
        }
    }
    Ok(())
}

/// Re-enters a running sandbox's namespaces from a fresh process, without
/// ever moving the calling (reactor) thread's own process into them.
///
/// `setns(CLONE_NEWPID)` only affects processes created after the call, so
/// joining the pid namespace takes two forks: an intermediate process calls
/// `setns` on all three namespaces, then forks again -- that second child is
/// the one actually born inside them. The intermediate process reports the
/// inner child's pid back over a pipe and exits; the caller only ever reaps
/// the intermediate and returns the inner child's pid. `child_body` runs
/// only in the inner child and must not return -- it owns the rest of that
/// process's life (typically: `setns` into a container's mount namespace,
/// set up stdio, `execve`).
pub fn enter<F>(ns: &NsHandles, child_body: F) -> Result<Pid>
where
    F: FnOnce() -> std::convert::Infallible,
{
    let (pid_read, pid_write) = pipe().map_err(AgentError::Os)?;

    match unsafe { fork() }.map_err(AgentError::Os)? {
        ForkResult::Parent { child: middle } => {
            drop(pid_write);
            let mut buf = [0u8; 4];
            let result = read_exact_pipe(pid_read.as_fd(), &mut buf);
            let _ = waitpid(middle, None);
            result?;
            Ok(Pid::from_raw(i32::from_be_bytes(buf)))
        }
        ForkResult::Child => {
            drop(pid_read);
            if setns(&ns.pid, CloneFlags::CLONE_NEWPID).is_err()
                || setns(&ns.uts, CloneFlags::CLONE_NEWUTS).is_err()
                || setns(&ns.ipc, CloneFlags::CLONE_NEWIPC).is_err()
            {
                unsafe { nix::libc::_exit(125) };
            }
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child: inner }) => {
                    let _ = write(&pid_write, &inner.as_raw().to_be_bytes());
                    unsafe { nix::libc::_exit(0) };
                }
                Ok(ForkResult::Child) => {
                    drop(pid_write);
                    match child_body() {}
                }
                Err(_) => unsafe { nix::libc::_exit(126) },
            }
        }
    }
}

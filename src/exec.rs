//! The exec supervisor: spawns processes inside a container's namespaces,
//! wires up their stdio to the tty multiplexer, and reaps them through the
//! pidfd-readiness path instead of a process-wide `SIGCHLD` handler.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::pty::{openpty, Winsize};
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, read, setsid, write, ForkResult, Pid};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::pidfd::PidFd;
use crate::sandbox::NsHandles;

/// What the caller asked for: a PTY (single fd, `stdin==stdout`, no stderr)
/// or three plain pipes.
pub struct SpawnRequest<'a> {
    pub cmd: &'a [String],
    pub envs: &'a [String],
    pub tty: bool,
    pub mnt_ns_fd: Option<RawFd>,
}

/// Host-side handles for a freshly spawned process: its pid, a readiness
/// source for reaping, and async stdio endpoints.
pub struct SpawnedExec {
    pub pid: i32,
    pub pidfd: PidFd,
    pub tty: bool,
    /// PTY master, when `tty`.
    pub ptyfd: Option<AsyncFd<OwnedFd>>,
    pub stdin: Option<AsyncFd<OwnedFd>>,
    pub stdout: Option<AsyncFd<OwnedFd>>,
    pub stderr: Option<AsyncFd<OwnedFd>>,
}

/// Spawns one process inside the sandbox's shared namespaces plus the
/// target container's mount namespace.
///
/// Forks, enters the pid/uts/ipc namespaces via the sandbox then the
/// container's mount namespace, restores the signal mask, sets up stdio,
/// and `execve`s.
pub fn spawn(ns: &NsHandles, req: SpawnRequest<'_>) -> Result<SpawnedExec> {
    if req.tty {
        spawn_tty(ns, req)
    } else {
        spawn_pipes(ns, req)
    }
}

fn spawn_tty(ns: &NsHandles, req: SpawnRequest<'_>) -> Result<SpawnedExec> {
    let winsize = Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).map_err(AgentError::Os)?;
    let master = pty.master;
    let slave = pty.slave;

    let cmd = req.cmd.to_vec();
    let envs = req.envs.to_vec();
    let mnt_ns_fd = req.mnt_ns_fd;
    let slave_fd = slave.as_raw_fd();

    let pid = crate::sandbox::enter(ns, move || {
        let _ = setsid();
        unsafe {
            if nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as _, 0) != 0 {
                nix::libc::_exit(127);
            }
        }
        enter_container_and_exec(mnt_ns_fd, slave_fd, slave_fd, slave_fd, &cmd, &envs)
    })?;

    drop(slave);
    let pidfd = PidFd::open(pid.as_raw()).map_err(AgentError::Io)?;
    let master_async = AsyncFd::new(master).map_err(AgentError::Io)?;

    Ok(SpawnedExec {
        pid: pid.as_raw(),
        pidfd,
        tty: true,
        ptyfd: Some(master_async),
        stdin: None,
        stdout: None,
        stderr: None,
    })
}

fn spawn_pipes(ns: &NsHandles, req: SpawnRequest<'_>) -> Result<SpawnedExec> {
    let (stdin_r, stdin_w) = pipe().map_err(AgentError::Os)?;
    let (stdout_r, stdout_w) = pipe().map_err(AgentError::Os)?;
    let (stderr_r, stderr_w) = pipe().map_err(AgentError::Os)?;

    let cmd = req.cmd.to_vec();
    let envs = req.envs.to_vec();
    let mnt_ns_fd = req.mnt_ns_fd;
    let (stdin_r_fd, stdout_w_fd, stderr_w_fd) = (
        stdin_r.as_raw_fd(),
        stdout_w.as_raw_fd(),
        stderr_w.as_raw_fd(),
    );

    let pid = crate::sandbox::enter(ns, move || {
        enter_container_and_exec(
            mnt_ns_fd,
            stdin_r_fd,
            stdout_w_fd,
            stderr_w_fd,
            &cmd,
            &envs,
        )
    })?;

    drop(stdin_r);
    drop(stdout_w);
    drop(stderr_w);

    let pidfd = PidFd::open(pid.as_raw()).map_err(AgentError::Io)?;

    Ok(SpawnedExec {
        pid: pid.as_raw(),
        pidfd,
        tty: false,
        ptyfd: None,
        stdin: Some(AsyncFd::new(stdin_w).map_err(AgentError::Io)?),
        stdout: Some(AsyncFd::new(stdout_r).map_err(AgentError::Io)?),
        stderr: Some(AsyncFd::new(stderr_r).map_err(AgentError::Io)?),
    })
}

/// Runs only inside the freshly forked child (already in the sandbox's
/// pid/uts/ipc namespaces): enters the container's mount namespace, wires
/// up stdio, restores the default signal mask, and `execve`s the command.
/// Never returns.
fn enter_container_and_exec(
    mnt_ns_fd: Option<RawFd>,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    cmd: &[String],
    envs: &[String],
) -> std::convert::Infallible {
    if let Some(fd) = mnt_ns_fd {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if nix::sched::setns(borrowed, nix::sched::CloneFlags::CLONE_NEWNS).is_err() {
            unsafe { nix::libc::_exit(126) };
        }
    }

    let _ = SigSet::empty().thread_set_mask();
    let _ = nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&SigSet::empty()),
        None,
    );

    let _ = dup2(stdin_fd, 0);
    let _ = dup2(stdout_fd, 1);
    let _ = dup2(stderr_fd, 2);
    if stdin_fd > 2 {
        let _ = close(stdin_fd);
    }
    if stdout_fd > 2 && stdout_fd != stdin_fd {
        let _ = close(stdout_fd);
    }
    if stderr_fd > 2 && stderr_fd != stdin_fd && stderr_fd != stdout_fd {
        let _ = close(stderr_fd);
    }

    for kv in envs {
        if let Some((k, v)) = kv.split_once('=') {
            std::env::set_var(k, v);
        }
    }

    if cmd.is_empty() {
        unsafe { nix::libc::_exit(127) };
    }
    let c_cmd: Vec<std::ffi::CString> = cmd
        .iter()
        .map(|s| std::ffi::CString::new(s.as_str()).unwrap_or_default())
        .collect();
    let _ = execvp(&c_cmd[0], &c_cmd);

    // execvp only returns on failure.
    unsafe { nix::libc::_exit(127) };
}

/// Applies a window-size change to a PTY master fd; a no-op for non-PTY
/// execs, handled by the caller before reaching here.
pub fn set_win_size(ptyfd: &AsyncFd<OwnedFd>, rows: u16, cols: u16) -> Result<()> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let res = unsafe {
        nix::libc::ioctl(
            ptyfd.as_raw_fd(),
            nix::libc::TIOCSWINSZ as _,
            &winsize as *const Winsize,
        )
    };
    if res != 0 {
        return Err(AgentError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Waits for a child's exit via its pidfd and reaps it, returning `(pid,
/// exit_code)`. Signal deaths are reported as exit code 0 rather than a
/// synthesized `128+signal` value.
pub async fn wait_exit(pidfd: &PidFd) -> Result<(i32, u8)> {
    let status = pidfd.wait().await.map_err(AgentError::Io)?;
    let (pid, code) = match status {
        WaitStatus::Exited(pid, code) => (pid.as_raw(), code as u8),
        WaitStatus::Signaled(pid, signal, _) => {
            debug!(pid = pid.as_raw(), ?signal, "exec killed by signal");
            (pid.as_raw(), 0)
        }
        other => {
            warn!(?other, "unexpected wait status");
            (0, 0)
        }
    };
    Ok((pid, code))
}

/// Sends a signal to a running exec's pid. Kept as a plain `kill(2)` rather
/// than going through the pidfd, since the caller may not have tracked a
/// pidfd for this specific kill path (KILLCONTAINER addresses by pid, not
/// by an open fd).
pub fn kill(pid: i32, signal: i32) -> Result<()> {
    let sig = Signal::try_from(signal).map_err(AgentError::Os)?;
    nix::sys::signal::kill(Pid::from_raw(pid), sig).map_err(AgentError::Os)?;
    Ok(())
}

/// Enters `mnt_ns_fd`'s mount namespace in the calling (already-forked)
/// process. A no-op when `mnt_ns_fd` is `None`, matching WRITEFILE/READFILE
/// against the agent's own rootfs in that case.
fn enter_mnt_ns(mnt_ns_fd: Option<RawFd>) -> std::result::Result<(), ()> {
    let Some(fd) = mnt_ns_fd else { return Ok(()) };
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    setns(borrowed, CloneFlags::CLONE_NEWNS).map_err(|_| ())
}

/// Forked helper body for WRITEFILE: enters the
/// container's mount namespace, writes `data` to `path`, and reports a
/// single status byte (`0` ok, `1` error) back over `status_w`. Never
/// returns -- runs only inside the freshly forked child.
fn write_file_child(mnt_ns_fd: Option<RawFd>, path: &str, data: &[u8], status_w: OwnedFd) -> ! {
    let code = match enter_mnt_ns(mnt_ns_fd) {
        Err(()) => 1u8,
        Ok(()) => match std::fs::write(path, data) {
            Ok(()) => 0,
            Err(_) => 1,
        },
    };
    let _ = write(&status_w, &[code]);
    unsafe { nix::libc::_exit(0) };
}

/// Forked helper body for READFILE: enters the container's mount namespace,
/// reads `path`, and reports a status byte followed by a 4-byte
/// big-endian length and the file's bytes (on success) over `status_w`.
fn read_file_child(mnt_ns_fd: Option<RawFd>, path: &str, status_w: OwnedFd) -> ! {
    let result = match enter_mnt_ns(mnt_ns_fd) {
        Err(()) => None,
        Ok(()) => std::fs::read(path).ok(),
    };
    match result {
        Some(data) => {
            let _ = write(&status_w, &[0u8]);
            let _ = write(&status_w, &(data.len() as u32).to_be_bytes());
            let _ = write(&status_w, &data);
        }
        None => {
            let _ = write(&status_w, &[1u8]);
        }
    }
    unsafe { nix::libc::_exit(0) };
}

fn read_exact_from_pipe(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
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

/// Runs the WRITEFILE forked-helper exchange synchronously: fork, child
/// writes the file and reports a status byte, parent reads it and reaps the
/// child. A pipe, not shared memory, carries the result.
fn run_write_file_helper(mnt_ns_fd: Option<RawFd>, path: &str, data: &[u8]) -> Result<()> {
    let (status_r, status_w) = pipe().map_err(AgentError::Os)?;
    match unsafe { fork() }.map_err(AgentError::Os)? {
        ForkResult::Child => write_file_child(mnt_ns_fd, path, data, status_w),
        ForkResult::Parent { child } => {
            drop(status_w);
            let mut status = [0u8; 1];
            read_exact_from_pipe(status_r.as_fd(), &mut status)?;
            let _ = waitpid(child, None);
            if status[0] == 0 {
                Ok(())
            } else {
                Err(AgentError::Os(nix::errno::Errno::EIO))
            }
        }
    }
}

/// Runs the READFILE forked-helper exchange: same shape as
/// [`run_write_file_helper`], but the child also streams the file's bytes
/// back on success.
fn run_read_file_helper(mnt_ns_fd: Option<RawFd>, path: &str) -> Result<Vec<u8>> {
    let (status_r, status_w) = pipe().map_err(AgentError::Os)?;
    match unsafe { fork() }.map_err(AgentError::Os)? {
        ForkResult::Child => read_file_child(mnt_ns_fd, path, status_w),
        ForkResult::Parent { child } => {
            drop(status_w);
            let mut status = [0u8; 1];
            read_exact_from_pipe(status_r.as_fd(), &mut status)?;
            if status[0] != 0 {
                let _ = waitpid(child, None);
                return Err(AgentError::Os(nix::errno::Errno::EIO));
            }
            let mut len_buf = [0u8; 4];
            read_exact_from_pipe(status_r.as_fd(), &mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            read_exact_from_pipe(status_r.as_fd(), &mut data)?;
            let _ = waitpid(child, None);
            Ok(data)
        }
    }
}

/// Writes `data` into `path` inside a container's mount namespace. Runs the
/// fork-and-wait exchange on a blocking-pool thread so a slow write doesn't
/// stall the reactor's `select!` loop.
pub async fn write_file(mnt_ns_fd: Option<RawFd>, path: String, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || run_write_file_helper(mnt_ns_fd, &path, &data))
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))?
}

/// Reads `path` from inside a container's mount namespace.
pub async fn read_file(mnt_ns_fd: Option<RawFd>, path: String) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || run_read_file_helper(mnt_ns_fd, &path))
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))?
}

/// Writes `1` to every currently-offline CPU/memory hotplug entry under
/// `/sys/devices/system/{cpu,memory}`. Unlike the WRITEFILE/READFILE helpers,
/// the parent never waits for this one synchronously -- it is reaped later
/// through the ordinary pidfd path like any other transient child,
/// contributing no registry entry since it isn't attached to a `seq`
/// (`ExitedWho::Untracked`).
fn online_all_cpu_mem() {
    for base in ["/sys/devices/system/cpu", "/sys/devices/system/memory"] {
        let Ok(entries) = std::fs::read_dir(base) else {
            continue;
        };
        for entry in entries.flatten() {
            let online_path = entry.path().join("online");
            let Ok(state) = std::fs::read_to_string(&online_path) else {
                continue;
            };
            if state.trim() == "0" {
                let _ = std::fs::write(&online_path, b"1");
            }
        }
    }
}

/// Forks the ONLINECPUMEM helper and returns its `PidFd` for the caller to
/// hand to [`crate::reactor::Agent::track_exit`]. The parent ACKs as soon as
/// the fork succeeds and does not wait for the helper.
pub fn spawn_online_helper() -> Result<PidFd> {
    match unsafe { fork() }.map_err(AgentError::Os)? {
        ForkResult::Child => {
            online_all_cpu_mem();
            unsafe { nix::libc::_exit(0) };
        }
        ForkResult::Parent { child } => PidFd::open(child.as_raw()).map_err(AgentError::Io),
    }
}

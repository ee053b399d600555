//! Event reactor: the single task that owns the
//! registry and is the only place state mutation happens. Built on a
//! current-thread Tokio runtime plus `tokio::select!` rather than a
//! hand-rolled `epoll_wait` loop -- the idiomatic re-expression of "one
//! thread, handlers run to completion between suspension points" that this
//! crate's dependency stack already favors.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::Result;
use crate::external::External;
use crate::exec::SpawnedExec;
use crate::pidfd::PidFd;
use crate::proto::frame::{ControlFrame, TtyFrame};
use crate::proto::MsgType;
use crate::registry::Registry;
use crate::sandbox::SandboxHandle;

/// Which tracked process a reaped exit belongs to.
pub enum ExitedWho {
    Exec(u64),
    SandboxInit,
    /// An untracked transient helper (e.g. ONLINECPUMEM's forked worker)
    /// that isn't attached to any `seq` and needs no registry update.
    Untracked,
}

/// Per-exec bookkeeping the reactor needs beyond what's in the registry:
/// the async stdio handles and output-pump state.
pub struct ExecIo {
    pub stdin: Option<Arc<AsyncFd<OwnedFd>>>,
    pub ptyfd: Option<Arc<AsyncFd<OwnedFd>>>,
}

pub struct Agent {
    pub registry: Registry,
    pub external: Box<dyn External>,
    pub control_fd: Arc<AsyncFd<OwnedFd>>,
    pub tty_fd: Arc<AsyncFd<OwnedFd>>,
    pub tty_tx: mpsc::UnboundedSender<TtyFrame>,
    pub sandbox: Option<SandboxHandle>,
    pub exec_io: HashMap<u64, ExecIo>,
    pub exits: JoinSet<(ExitedWho, std::io::Result<(i32, u8)>)>,
    pub pending_stop_ack: Option<u32>,
    pub destroying: bool,
    pub shutdown: bool,
    /// Fires once the `StopPod`/`DestroyPod` grace period elapses without
    /// the sandbox having died on its own, triggering the final SIGKILL
    /// sweep. Cloned into a one-shot delay task by
    /// `handlers::stop`; `run` drains it alongside the other event sources.
    pub force_kill_tx: mpsc::UnboundedSender<()>,
    force_kill_rx: mpsc::UnboundedReceiver<()>,
}

impl Agent {
    pub fn new(
        external: Box<dyn External>,
        control_fd: Arc<AsyncFd<OwnedFd>>,
        tty_fd: Arc<AsyncFd<OwnedFd>>,
        tty_tx: mpsc::UnboundedSender<TtyFrame>,
    ) -> Self {
        let (force_kill_tx, force_kill_rx) = mpsc::unbounded_channel();
        Self {
            registry: Registry::new(),
            external,
            control_fd,
            tty_fd,
            tty_tx,
            sandbox: None,
            exec_io: HashMap::new(),
            exits: JoinSet::new(),
            pending_stop_ack: None,
            destroying: false,
            shutdown: false,
            force_kill_tx,
            force_kill_rx,
        }
    }

    /// Registers a spawned exec's reap-wait future with the central
    /// `JoinSet`, the mechanism that replaces a process-wide `SIGCHLD`
    /// handler.
    pub fn track_exit(&mut self, who: ExitedWho, pidfd: PidFd) {
        self.exits.spawn(async move {
            let res = crate::exec::wait_exit(&pidfd).await;
            (who, res.map_err(|e| std::io::Error::other(e.to_string())))
        });
    }

    /// Takes ownership of a freshly spawned exec's stdio, starts its
    /// output-pump task(s), and records the
    /// handles the reactor needs for inbound routing and resize. Returns
    /// the exec's `PidFd` for the caller to hand to [`Agent::track_exit`].
    pub fn adopt_spawned(&mut self, seq: u64, spawned: SpawnedExec) -> PidFd {
        let SpawnedExec {
            pidfd,
            ptyfd,
            stdin,
            stdout,
            stderr,
            ..
        } = spawned;

        let pty_arc = ptyfd.map(Arc::new);
        let stdin_arc = stdin.map(Arc::new);

        if let Some(pty) = &pty_arc {
            tokio::spawn(crate::tty::pump_output(seq, pty.clone(), self.tty_tx.clone()));
        }
        if let Some(stdout) = stdout {
            tokio::spawn(crate::tty::pump_output(seq, Arc::new(stdout), self.tty_tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(crate::tty::pump_output(seq, Arc::new(stderr), self.tty_tx.clone()));
        }

        self.exec_io.insert(
            seq,
            ExecIo {
                stdin: stdin_arc.or_else(|| pty_arc.clone()),
                ptyfd: pty_arc,
            },
        );
        pidfd
    }

    pub async fn send_control(&self, frame: ControlFrame) {
        if let Err(e) = crate::channel::write_frame(&self.control_fd, &frame).await {
            warn!(error = %e, "failed to write control frame");
        }
    }

    pub async fn ack(&self, payload: Vec<u8>) {
        self.send_control(ControlFrame::new(MsgType::Ack as u32, payload))
            .await;
    }

    pub async fn error(&self) {
        self.send_control(ControlFrame::new(MsgType::Error as u32, Vec::new()))
            .await;
    }
}

/// Runs the reactor to completion: receives decoded control/tty frames and
/// reaped exits, dispatches each, and loops until `DESTROYPOD` sets
/// `shutdown`.
pub async fn run(
    mut agent: Agent,
    mut control_rx: mpsc::Receiver<ControlFrame>,
    mut tty_rx: mpsc::Receiver<TtyFrame>,
) {
    agent
        .send_control(ControlFrame::new(MsgType::Ready as u32, Vec::new()))
        .await;
    info!("agent ready");

    loop {
        if agent.shutdown {
            return;
        }

        tokio::select! {
            frame = control_rx.recv() => {
                match frame {
                    Some(frame) => crate::handlers::dispatch_control(&mut agent, frame).await,
                    None => {
                        warn!("control channel closed, terminating reactor");
                        return;
                    }
                }
            }
            frame = tty_rx.recv() => {
                match frame {
                    Some(frame) => crate::handlers::dispatch_tty(&mut agent, frame).await,
                    None => {
                        warn!("tty channel closed");
                    }
                }
            }
            Some(res) = agent.exits.join_next() => {
                match res {
                    Ok((who, outcome)) => crate::handlers::dispatch_exit(&mut agent, who, outcome).await,
                    Err(e) => warn!(error = %e, "exit-wait task panicked"),
                }
            }
            Some(()) = agent.force_kill_rx.recv() => {
                if agent.pending_stop_ack.is_some() || agent.destroying {
                    warn!("teardown grace period elapsed, sweeping remaining processes");
                    crate::reaper::broadcast_sigkill_sweep();
                }
            }
        }
    }
}

//! Command handlers: one function per control verb,
//! built on top of the exec supervisor, sandbox builder, and
//! registry. Each handler returns `Result<Option<Vec<u8>>>` to
//! [`dispatch_control`], which turns that into a single ACK (with optional
//! payload) or ERROR frame, uniformly across every verb.

use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::{error, warn};

use crate::error::{AgentError, Result};
use crate::exec::{self, SpawnRequest};
use crate::external::SHARED_DIR;
use crate::proto::frame::{split_writefile_payload, ControlFrame, TtyFrame};
use crate::proto::records::{
    ContainerSpec, ExecSpec, FileCmd, KillCmd, PodSpec, RemoveContainerCmd, WinSizeCmd,
};
use crate::proto::MsgType;
use crate::reactor::{Agent, ExitedWho};
use crate::reaper;
use crate::registry;
use crate::sandbox::{self, SandboxHandle};
use crate::tty::{route_inbound, InboundAction};

/// Dispatches one decoded control frame: looks up its verb, runs the
/// matching handler, and emits the reply. Unknown message types get a bare
/// `ERROR`.
pub async fn dispatch_control(agent: &mut Agent, frame: ControlFrame) {
    let Some(msg_type) = MsgType::from_u32(frame.msg_type) else {
        warn!(msg_type = frame.msg_type, "unknown control message type");
        agent.error().await;
        return;
    };

    use MsgType::*;
    match msg_type {
        GetVersion => {
            agent
                .ack(crate::proto::API_VERSION.to_be_bytes().to_vec())
                .await
        }
        StartPod => {
            let r = start_pod(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        NewContainer => {
            let r = new_container(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        ExecCmd => {
            let r = exec_cmd(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        KillContainer => {
            let r = kill_container(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        RemoveContainer => {
            let r = remove_container(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        WriteFile => {
            let r = write_file(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        ReadFile => {
            let r = read_file(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        WinSize => {
            let r = win_size(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        OnlineCpuMem => {
            let r = online_cpu_mem(agent).await;
            reply(agent, r).await;
        }
        SetupInterface => {
            let r = setup_interface(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        SetupRoute => {
            let r = setup_route(agent, &frame.payload).await;
            reply(agent, r).await;
        }
        Ping | GetPod => agent.ack(Vec::new()).await,
        Ready => {
            agent.external.rescan_devices();
            agent.ack(Vec::new()).await;
        }
        StopPod => stop(agent, false).await,
        DestroyPod => stop(agent, true).await,
        Ack | Error => {
            warn!(msg_type = frame.msg_type, "agent-originated type sent by host");
            agent.error().await;
        }
    }
}

/// Turns a handler's result into the single reply the control channel
/// allows per request.
async fn reply(agent: &mut Agent, result: Result<Option<Vec<u8>>>) {
    match result {
        Ok(payload) => agent.ack(payload.unwrap_or_default()).await,
        Err(e) => {
            if e.is_severe() {
                error!(error = %e, "command handler failed");
            } else {
                warn!(error = %e, "command handler failed");
            }
            agent.error().await;
        }
    }
}

async fn start_pod(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let spec: PodSpec = serde_json::from_slice(payload)?;
    if agent.registry.pod.is_some() {
        return Err(AgentError::Internal("pod already started".into()));
    }

    let control_fd = agent.control_fd.as_raw_fd();
    let tty_fd = agent.tty_fd.as_raw_fd();
    let sandbox = sandbox::start(&spec.hostname, vec![control_fd, tty_fd])?;
    let init_pid = sandbox.init_pid;
    agent.track_exit(ExitedWho::SandboxInit, sandbox.pidfd);
    agent.sandbox = Some(SandboxHandle {
        init_pid,
        ns: sandbox.ns,
    });
    agent.registry.pod = Some(registry::Pod {
        hostname: spec.hostname.clone(),
        share_tag: spec.share_tag.clone(),
        init_pid,
        remains: 0,
    });

    if let Some(tag) = &spec.share_tag {
        let target = Path::new(SHARED_DIR);
        std::fs::create_dir_all(target)?;
        agent.external.mount_shared(tag, target)?;
    }

    for container in &spec.containers {
        start_container(agent, container)?;
    }

    Ok(None)
}

async fn new_container(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let spec: ContainerSpec = serde_json::from_slice(payload)?;
    if agent.sandbox.is_none() {
        return Err(AgentError::Internal("no pod started".into()));
    }
    start_container(agent, &spec)?;
    Ok(None)
}

/// Shared by `StartPod`'s batch of containers and a standalone
/// `NewContainer`: prepares the rootfs, spawns the primary exec inside the
/// sandbox's namespaces plus the container's mount namespace, and registers
/// both the container and its primary exec.
fn start_container(agent: &mut Agent, spec: &ContainerSpec) -> Result<()> {
    if agent.registry.containers.contains_key(&spec.id) {
        return Err(AgentError::Internal(format!(
            "container {} already exists",
            spec.id
        )));
    }

    let prepared = agent.external.prepare_rootfs(&spec.id, &spec.rootfs)?;
    let ns = agent
        .sandbox
        .as_ref()
        .ok_or_else(|| AgentError::Internal("sandbox not started".into()))?;
    let spawned = exec::spawn(
        &ns.ns,
        SpawnRequest {
            cmd: &spec.cmd,
            envs: &spec.envs,
            tty: spec.tty,
            mnt_ns_fd: prepared.mnt_ns_fd,
        },
    )?;
    let pid = spawned.pid;
    let tty = spawned.tty;
    let pidfd = agent.adopt_spawned(spec.seq, spawned);
    agent.track_exit(ExitedWho::Exec(spec.seq), pidfd);

    agent
        .registry
        .insert_exec(registry::Exec::new(spec.seq, Some(spec.id.clone()), pid, tty));
    agent.registry.insert_container(registry::Container {
        id: spec.id.clone(),
        rootfs: spec.rootfs.clone(),
        primary_seq: spec.seq,
        mnt_ns_fd: prepared.mnt_ns_fd,
    });
    agent.registry.pod_mut()?.remains += 1;
    Ok(())
}

async fn exec_cmd(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let spec: ExecSpec = serde_json::from_slice(payload)?;
    let mnt_ns_fd = agent.registry.container(&spec.container)?.mnt_ns_fd;
    let ns = agent
        .sandbox
        .as_ref()
        .ok_or_else(|| AgentError::Internal("sandbox not started".into()))?;
    let spawned = exec::spawn(
        &ns.ns,
        SpawnRequest {
            cmd: &spec.cmd,
            envs: &spec.envs,
            tty: spec.tty,
            mnt_ns_fd,
        },
    )?;
    let pid = spawned.pid;
    let tty = spawned.tty;
    let pidfd = agent.adopt_spawned(spec.seq, spawned);
    agent.track_exit(ExitedWho::Exec(spec.seq), pidfd);
    agent.registry.insert_exec(registry::Exec::new(
        spec.seq,
        Some(spec.container.clone()),
        pid,
        tty,
    ));
    Ok(None)
}

async fn kill_container(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let cmd: KillCmd = serde_json::from_slice(payload)?;
    let primary_seq = agent.registry.container(&cmd.container)?.primary_seq;
    let pid = agent
        .registry
        .exec(primary_seq)
        .ok_or_else(|| AgentError::NotFound(format!("exec {primary_seq}")))?
        .pid;
    exec::kill(pid, cmd.signal)?;
    Ok(None)
}

async fn remove_container(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let cmd: RemoveContainerCmd = serde_json::from_slice(payload)?;
    let container = agent.registry.remove_container(&cmd.container)?;
    agent.registry.remove_exec(container.primary_seq);
    agent.exec_io.remove(&container.primary_seq);
    if let Some(fd) = container.mnt_ns_fd {
        let _ = nix::unistd::close(fd);
    }
    Ok(None)
}

async fn write_file(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let (header, data) = split_writefile_payload(payload)?;
    let cmd: FileCmd = serde_json::from_slice(header)?;
    let mnt_ns_fd = agent.registry.container(&cmd.container)?.mnt_ns_fd;
    exec::write_file(mnt_ns_fd, cmd.file, data.to_vec()).await?;
    Ok(None)
}

async fn read_file(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let cmd: FileCmd = serde_json::from_slice(payload)?;
    let mnt_ns_fd = agent.registry.container(&cmd.container)?.mnt_ns_fd;
    let data = exec::read_file(mnt_ns_fd, cmd.file).await?;
    Ok(Some(data))
}

/// `row == 0 && column == 0` is the host's "no-op" sentinel; a missing exec
/// or a non-PTY exec is likewise a silent no-op, never an `ERROR`.
async fn win_size(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let cmd: WinSizeCmd = serde_json::from_slice(payload)?;
    if cmd.row == 0 && cmd.column == 0 {
        return Ok(None);
    }
    if let Some(io) = agent.exec_io.get(&cmd.seq) {
        if let Some(ptyfd) = &io.ptyfd {
            exec::set_win_size(ptyfd, cmd.row, cmd.column)?;
        }
    }
    Ok(None)
}

async fn online_cpu_mem(agent: &mut Agent) -> Result<Option<Vec<u8>>> {
    let pidfd = exec::spawn_online_helper()?;
    agent.track_exit(ExitedWho::Untracked, pidfd);
    Ok(None)
}

async fn setup_interface(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let json: serde_json::Value = serde_json::from_slice(payload)?;
    agent.external.configure_network(&json)?;
    Ok(None)
}

async fn setup_route(agent: &mut Agent, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let json: serde_json::Value = serde_json::from_slice(payload)?;
    agent.external.configure_route(&json)?;
    Ok(None)
}

/// `STOPPOD`/`DESTROYPOD`: broadcasts SIGTERM to all of `/proc`, signals
/// every tracked exec and the sandbox init itself (upgrading to SIGKILL for
/// anything ignoring SIGTERM), arms a grace-period sweep, and defers the
/// reply until the sandbox actually dies -- handled in
/// [`dispatch_exit`](crate::reactor) when `ExitedWho::SandboxInit` is
/// reaped.
async fn stop(agent: &mut Agent, destroying: bool) {
    if agent.registry.pod.is_none() {
        if destroying {
            agent.shutdown = true;
        } else {
            agent.ack(Vec::new()).await;
        }
        return;
    }

    agent.destroying = destroying;
    agent.pending_stop_ack = Some(1);

    reaper::broadcast_sigterm_sweep();
    if let Some(sandbox) = &agent.sandbox {
        reaper::signal_pid(sandbox.init_pid);
    }
    if let Err(e) = reaper::signal_live_execs(&agent.registry) {
        warn!(error = %e, "failed to signal live execs during teardown");
    }
    agent.external.teardown_network();

    let tx = agent.force_kill_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(reaper::TERM_GRACE).await;
        let _ = tx.send(());
    });
}

/// Routes one decoded inbound tty frame.
pub async fn dispatch_tty(agent: &mut Agent, frame: TtyFrame) {
    let seq = frame.seq;
    let exists = agent.registry.exec(seq).is_some();
    let (exited, close_requested, is_tty) = agent
        .registry
        .exec(seq)
        .map(|e| (e.exit, e.close_stdin_request, e.tty))
        .unwrap_or((false, false, false));

    match route_inbound(exists, exited, close_requested) {
        InboundAction::Goodbye => {
            let _ = agent.tty_tx.send(TtyFrame::goodbye(seq));
        }
        InboundAction::Drop => {}
        InboundAction::Deliver => {
            if frame.is_eof() {
                if !is_tty {
                    if let Some(exec) = agent.registry.exec_mut(seq) {
                        exec.close_stdin_request = true;
                    }
                    if let Some(io) = agent.exec_io.get_mut(&seq) {
                        io.stdin = None;
                    }
                }
                return;
            }
            if let Some(io) = agent.exec_io.get(&seq) {
                if let Some(stdin) = &io.stdin {
                    let _ = crate::ioutil::try_write_once(stdin, &frame.data);
                }
            }
        }
    }
}

/// Applies a reaped exit to the registry.
pub async fn dispatch_exit(
    agent: &mut Agent,
    who: ExitedWho,
    outcome: std::io::Result<(i32, u8)>,
) {
    match who {
        ExitedWho::Untracked => {}
        ExitedWho::SandboxInit => {
            let had_share_tag = agent
                .registry
                .pod
                .as_ref()
                .map(|p| p.share_tag.is_some())
                .unwrap_or(false);
            if had_share_tag {
                agent
                    .external
                    .unmount_shared_best_effort(Path::new(SHARED_DIR));
            }
            agent.registry.containers.clear();
            agent.registry.execs.clear();
            agent.exec_io.clear();
            agent.sandbox = None;
            agent.registry.pod = None;

            if agent.destroying {
                agent.shutdown = true;
            } else if agent.pending_stop_ack.take().is_some() {
                agent.ack(Vec::new()).await;
            }
        }
        ExitedWho::Exec(seq) => {
            let (_pid, code) = outcome.unwrap_or((0, 0));
            let was_primary = agent
                .registry
                .containers
                .values()
                .any(|c| c.primary_seq == seq);

            if let Some(exec) = agent.registry.exec_mut(seq) {
                exec.exit = true;
                exec.exit_code = code;
                if !exec.eof_sent {
                    exec.eof_sent = true;
                    let _ = agent.tty_tx.send(TtyFrame::goodbye(seq));
                }
            }
            agent.exec_io.remove(&seq);

            if was_primary {
                if let Ok(pod) = agent.registry.pod_mut() {
                    pod.remains = pod.remains.saturating_sub(1);
                }
            }
        }
    }
}

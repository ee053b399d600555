//! In-memory pod/container/exec tables, expressed as owning `HashMap`s keyed
//! by id/seq.
//!
//! Everything here is mutated exclusively by the reactor's single task; no
//! locking is used or needed.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use crate::error::{AgentError, Result};

/// A single launched process, identified by a host-assigned sequence number.
pub struct Exec {
    pub seq: u64,
    pub container_id: Option<String>,
    pub pid: i32,
    pub tty: bool,
    /// PTY master fd, only set when `tty`.
    pub ptyfd: Option<std::os::fd::RawFd>,
    pub stdin_fd: Option<OwnedFd>,
    pub exit: bool,
    pub exit_code: u8,
    pub close_stdin_request: bool,
    pub eof_sent: bool,
}

impl Exec {
    pub fn new(seq: u64, container_id: Option<String>, pid: i32, tty: bool) -> Self {
        Self {
            seq,
            container_id,
            pid,
            tty,
            ptyfd: None,
            stdin_fd: None,
            exit: false,
            exit_code: 0,
            close_stdin_request: false,
            eof_sent: false,
        }
    }
}

/// A process tree with its own mount view inside the pod.
pub struct Container {
    pub id: String,
    pub rootfs: String,
    pub primary_seq: u64,
    pub mnt_ns_fd: Option<std::os::fd::RawFd>,
}

/// The sandbox (shared namespaces) plus the set of containers living in it.
#[derive(Default)]
pub struct Pod {
    pub hostname: String,
    pub share_tag: Option<String>,
    pub init_pid: i32,
    pub remains: usize,
}

/// Owning tables for the pod singleton plus its containers and execs.
#[derive(Default)]
pub struct Registry {
    pub pod: Option<Pod>,
    pub containers: HashMap<String, Container>,
    pub execs: HashMap<u64, Exec>,
    pid_to_seq: HashMap<i32, u64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pod(&self) -> Result<&Pod> {
        self.pod
            .as_ref()
            .ok_or_else(|| AgentError::Internal("no pod started".into()))
    }

    pub fn pod_mut(&mut self) -> Result<&mut Pod> {
        self.pod
            .as_mut()
            .ok_or_else(|| AgentError::Internal("no pod started".into()))
    }

    pub fn insert_container(&mut self, container: Container) {
        self.containers.insert(container.id.clone(), container);
    }

    pub fn container(&self, id: &str) -> Result<&Container> {
        self.containers
            .get(id)
            .ok_or_else(|| AgentError::NotFound(format!("container {id}")))
    }

    pub fn remove_container(&mut self, id: &str) -> Result<Container> {
        let container = self.container(id)?;
        let primary = self.execs.get(&container.primary_seq);
        if let Some(primary) = primary {
            if !primary.exit {
                return Err(AgentError::Busy(format!("container {id} still running")));
            }
        }
        Ok(self.containers.remove(id).expect("checked above"))
    }

    pub fn insert_exec(&mut self, exec: Exec) {
        self.pid_to_seq.insert(exec.pid, exec.seq);
        self.execs.insert(exec.seq, exec);
    }

    pub fn exec(&self, seq: u64) -> Option<&Exec> {
        self.execs.get(&seq)
    }

    pub fn exec_mut(&mut self, seq: u64) -> Option<&mut Exec> {
        self.execs.get_mut(&seq)
    }

    pub fn seq_for_pid(&self, pid: i32) -> Option<u64> {
        self.pid_to_seq.get(&pid).copied()
    }

    pub fn remove_exec(&mut self, seq: u64) -> Option<Exec> {
        let exec = self.execs.remove(&seq)?;
        self.pid_to_seq.remove(&exec.pid);
        Some(exec)
    }

    /// All pids of currently-tracked, non-exited execs plus the sandbox init
    /// pid, used by the teardown sweep.
    pub fn live_pids(&self) -> Vec<i32> {
        self.execs
            .values()
            .filter(|e| !e.exit)
            .map(|e| e.pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_running_container_is_busy() {
        let mut reg = Registry::new();
        reg.insert_exec(Exec::new(1, Some("c1".into()), 100, false));
        reg.insert_container(Container {
            id: "c1".into(),
            rootfs: "/tmp/x".into(),
            primary_seq: 1,
            mnt_ns_fd: None,
        });

        assert!(matches!(
            reg.remove_container("c1"),
            Err(AgentError::Busy(_))
        ));

        reg.exec_mut(1).unwrap().exit = true;
        assert!(reg.remove_container("c1").is_ok());
        assert!(matches!(
            reg.remove_container("c1"),
            Err(AgentError::NotFound(_))
        ));
    }

    #[test]
    fn pid_lookup_tracks_inserted_execs() {
        let mut reg = Registry::new();
        reg.insert_exec(Exec::new(7, None, 4242, false));
        assert_eq!(reg.seq_for_pid(4242), Some(7));
        reg.remove_exec(7);
        assert_eq!(reg.seq_for_pid(4242), None);
    }
}

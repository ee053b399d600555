//! Typed records the control channel's JSON payloads deserialize into.
//!
//! JSON parsing itself is out of scope for the core; this
//! module is the boundary where `serde_json` hands back typed values instead
//! of raw bytes.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PodSpec {
    pub hostname: String,
    #[serde(default)]
    pub share_tag: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    /// Host-assigned sequence number for this container's primary exec --
    /// containers are always created with one running process.
    pub seq: u64,
    /// Directory the rootfs is already materialized at; handed to
    /// `External::prepare_rootfs` rather than interpreted here.
    pub rootfs: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub envs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSpec {
    pub container: String,
    pub seq: u64,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub envs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillCmd {
    pub container: String,
    pub signal: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveContainerCmd {
    pub container: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WinSizeCmd {
    pub seq: u64,
    pub row: u16,
    pub column: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileCmd {
    pub container: String,
    pub file: String,
}

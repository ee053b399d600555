//! The trait boundary to everything the core deliberately treats as an
//! external collaborator: network setup, rootfs
//! preparation, and the shared-directory mount. The core only ever calls
//! through this trait; it never embeds a network stack or image service.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};
use nix::unistd::sync;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;

/// Fixed mount point for the pod's shared directory,
/// shared by `handlers::start_pod` (mount) and `handlers::dispatch_exit`
/// (unmount on sandbox teardown).
pub const SHARED_DIR: &str = "/tmp/hyper/shared";

/// An executable spec plus the mount namespace it should run in, handed back
/// by [`External::prepare_rootfs`].
pub struct PreparedRootfs {
    pub mnt_ns_fd: Option<RawFd>,
    pub rootfs_path: PathBuf,
}

pub trait External: Send + Sync {
    fn configure_network(&self, iface_json: &Value) -> Result<()>;
    fn configure_route(&self, route_json: &Value) -> Result<()>;
    fn teardown_network(&self);

    /// Resolves a container's rootfs descriptor into something the exec
    /// supervisor can `setns`/`chroot` into.
    fn prepare_rootfs(&self, container_id: &str, rootfs: &str) -> Result<PreparedRootfs>;

    fn mount_shared(&self, share_tag: &str, target: &Path) -> Result<()>;
    fn unmount_shared_best_effort(&self, target: &Path);

    /// Called on READY to rescan newly attached devices.
    fn rescan_devices(&self);
}

/// Default collaborator used when no host-specific integration is wired in:
/// treats `rootfs` as an already-materialized directory on disk and no-ops
/// network/shared-directory setup. Sufficient for local testing; a real
/// deployment swaps this for a host-backed implementation.
pub struct StubExternal {
    pub rootfs_base: PathBuf,
}

impl StubExternal {
    pub fn new(rootfs_base: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_base: rootfs_base.into(),
        }
    }
}

impl External for StubExternal {
    fn configure_network(&self, iface_json: &Value) -> Result<()> {
        debug!(?iface_json, "configure_network (stub, no-op)");
        Ok(())
    }

    fn configure_route(&self, route_json: &Value) -> Result<()> {
        debug!(?route_json, "configure_route (stub, no-op)");
        Ok(())
    }

    fn teardown_network(&self) {
        debug!("teardown_network (stub, no-op)");
    }

    fn prepare_rootfs(&self, container_id: &str, rootfs: &str) -> Result<PreparedRootfs> {
        let rootfs_path = if Path::new(rootfs).is_absolute() {
            PathBuf::from(rootfs)
        } else {
            self.rootfs_base.join(rootfs)
        };
        debug!(container_id, path = %rootfs_path.display(), "prepare_rootfs (stub passthrough)");
        Ok(PreparedRootfs {
            mnt_ns_fd: None,
            rootfs_path,
        })
    }

    fn mount_shared(&self, share_tag: &str, target: &Path) -> Result<()> {
        debug!(share_tag, path = %target.display(), "mount_shared (stub, no-op)");
        Ok(())
    }

    fn unmount_shared_best_effort(&self, target: &Path) {
        // unmount, then lazy-unmount, then rmdir, then sync.
        if umount2(target, MntFlags::empty()).is_err() {
            let _ = umount2(target, MntFlags::MNT_DETACH);
        }
        if let Err(e) = std::fs::remove_dir(target) {
            warn!(error = %e, path = %target.display(), "failed to remove shared dir");
        }
        sync();
    }

    fn rescan_devices(&self) {
        debug!("rescan_devices (stub, no-op)");
    }
}

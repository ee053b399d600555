//! Channel handler plus the thin I/O layer that turns a
//! raw serial fd into a stream of decoded frames.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::ioutil;
use crate::proto::frame::ControlFrame;

/// Opens a channel device non-blocking so it can be wrapped in an
/// `AsyncFd`. The control channel's "opened blocking" is just the open(2)
/// call itself -- every read still goes through readiness polling once the
/// fd is registered with the reactor.
pub fn open_device(path: &str) -> Result<AsyncFd<OwnedFd>> {
    let fd = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty()).map_err(AgentError::Os)?;
    AsyncFd::new(fd).map_err(AgentError::Io)
}

/// Reads raw bytes off `fd`, accumulates them, and forwards one decoded
/// [`ControlFrame`] per complete frame to `tx`. Runs as its own task so the
/// central reactor loop never blocks on partial reads.
pub async fn run_reader(fd: Arc<AsyncFd<OwnedFd>>, tx: mpsc::Sender<ControlFrame>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match ioutil::read_once(&fd, &mut chunk).await {
            Ok(0) => {
                debug!("control channel EOF");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "control channel read error");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match ControlFrame::decode(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "fatal control channel framing error");
                    return;
                }
            }
        }
    }
}

/// Writes one control frame, looping over `writable()` readiness until the
/// whole frame is on the wire.
pub async fn write_frame(fd: &AsyncFd<OwnedFd>, frame: &ControlFrame) -> Result<()> {
    ioutil::write_all(fd, &frame.encode()).await
}

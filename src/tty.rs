//! Tty multiplexer: routes inbound tty frames to an
//! exec's stdin and frames outbound stdout/stderr bytes back to the host.
//! Ordering within one `seq` falls out of the structure: one reader task per
//! exec stdout/stderr, funneled through a single sender into a single
//! writer task, so bytes never get reordered relative to their source.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ioutil;
use crate::proto::frame::{TtyFrame, TTY_MAX_FRAME};

pub fn open_device(path: &str) -> Result<AsyncFd<OwnedFd>> {
    crate::channel::open_device(path)
}

/// Reads raw bytes off the tty channel fd, decodes frames, forwards them.
pub async fn run_reader(fd: Arc<AsyncFd<OwnedFd>>, tx: mpsc::Sender<TtyFrame>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match ioutil::read_once(&fd, &mut chunk).await {
            Ok(0) => {
                debug!("tty channel EOF");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "tty channel read error");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match TtyFrame::decode(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "fatal tty channel framing error, closing");
                    return;
                }
            }
        }
    }
}

/// Drains outbound tty frames (from exec stdout/stderr pumps, or synthesized
/// "goodbye" frames) onto the wire, one at a time, preserving arrival order.
pub async fn run_writer(fd: Arc<AsyncFd<OwnedFd>>, mut rx: mpsc::UnboundedReceiver<TtyFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = ioutil::write_all(&fd, &frame.encode()).await {
            warn!(error = %e, "tty channel write error, closing");
            return;
        }
    }
}

/// Pumps one exec's stdout or stderr fd: reads up to the tty frame cap,
/// frames it under `seq`, and forwards to the shared outbound sender.
///
/// Stops once the fd hits EOF or errors, but never emits the goodbye frame
/// itself -- a PTY exec has one pump and a pipe exec has two (stdout,
/// stderr), so each closing independently would produce duplicate EOF
/// frames for one `seq`. The reap path in `handlers::dispatch_exit` is the
/// single place that sends it, guarded by `Exec::eof_sent`.
pub async fn pump_output(seq: u64, fd: Arc<AsyncFd<OwnedFd>>, tx: mpsc::UnboundedSender<TtyFrame>) {
    let mut chunk = [0u8; TTY_MAX_FRAME];
    loop {
        match ioutil::read_once(&fd, &mut chunk).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(TtyFrame::new(seq, chunk[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(seq, error = %e, "exec output pump ending");
                return;
            }
        }
    }
}

/// Routes one inbound tty frame given a mutable handle to the destination
/// exec's state. Returns `true` if bytes were (attempted to be) delivered,
/// `false` if the exec was unknown/closed and a goodbye should be sent.
///
/// Pulled out as a free function so the routing decision is unit-testable without a real fd.
pub fn route_inbound(exists: bool, exited: bool, close_requested: bool) -> InboundAction {
    if !exists {
        return InboundAction::Goodbye;
    }
    if exited || close_requested {
        return InboundAction::Drop;
    }
    InboundAction::Deliver
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    Deliver,
    Drop,
    Goodbye,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_seq_gets_goodbye() {
        assert_eq!(route_inbound(false, false, false), InboundAction::Goodbye);
    }

    #[test]
    fn exited_exec_drops_bytes() {
        assert_eq!(route_inbound(true, true, false), InboundAction::Drop);
    }

    #[test]
    fn closed_stdin_drops_bytes() {
        assert_eq!(route_inbound(true, false, true), InboundAction::Drop);
    }

    #[test]
    fn live_exec_delivers() {
        assert_eq!(route_inbound(true, false, false), InboundAction::Deliver);
    }
}

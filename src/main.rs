//! Binary entrypoint: the agent runs as PID 1 of the guest, so everything
//! before the reactor starts (early filesystem setup, rlimits, opening the
//! two serial channels) has nowhere else to live.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use pod_agent::external::StubExternal;
use pod_agent::{boot, channel, config, reactor, rlimits, tty};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = config::Args::parse_from_env();
    pod_agent::logging::init(args.verbose);

    if let Err(e) = boot::early_setup() {
        error!(error = %e, "early boot setup failed");
        std::process::exit(1);
    }
    if let Err(e) = rlimits::apply() {
        error!(error = %e, "failed to raise resource limits");
        std::process::exit(1);
    }

    let control_fd = match channel::open_device(&args.control_channel) {
        Ok(fd) => Arc::new(fd),
        Err(e) => {
            error!(error = %e, path = %args.control_channel, "failed to open control channel");
            std::process::exit(1);
        }
    };
    let tty_fd = match tty::open_device(&args.tty_channel) {
        Ok(fd) => Arc::new(fd),
        Err(e) => {
            error!(error = %e, path = %args.tty_channel, "failed to open tty channel");
            std::process::exit(1);
        }
    };
    let (control_tx, control_rx) = mpsc::channel(64);
    let (tty_in_tx, tty_in_rx) = mpsc::channel(64);
    let (tty_out_tx, tty_out_rx) = mpsc::unbounded_channel();

    tokio::spawn(channel::run_reader(control_fd.clone(), control_tx));
    tokio::spawn(tty::run_reader(tty_fd.clone(), tty_in_tx));
    tokio::spawn(tty::run_writer(tty_fd.clone(), tty_out_rx));

    let external = Box::new(StubExternal::new(args.rootfs_base));
    let agent = reactor::Agent::new(external, control_fd, tty_fd, tty_out_tx);

    reactor::run(agent, control_rx, tty_in_rx).await;
}

//! CLI argument handling. Ambient plumbing the binary needs regardless of the
//! core's scope — there is no multi-command grammar here,
//! just the paths and flags needed to start the reactor.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pod-agent", about = "In-guest pod control-plane agent")]
pub struct Args {
    /// Control channel device path.
    #[arg(long, default_value = "/dev/vport1p1")]
    pub control_channel: String,

    /// Tty channel device path.
    #[arg(long, default_value = "/dev/vport2p1")]
    pub tty_channel: String,

    /// Base directory container rootfs directories are resolved under.
    #[arg(long, default_value = "/run/pod-agent/rootfs")]
    pub rootfs_base: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn parse_from_env() -> Self {
        Args::parse()
    }
}

//! Main entry point for the CMM daemon.
//!
//! Starts one cluster membership monitor node and runs it until Ctrl+C or
//! SIGTERM. Startup is all-or-nothing: a bad candidate file or an
//! unbindable ring port exits with a failure status instead of limping
//! along half-configured.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info};

use cmm_core::event::LoggingMembershipListener;
use cmm_core::{CmmNode, NodeConfig, RingTimings};

mod startup;

#[derive(Parser, Debug)]
#[command(name = "cmm-server", about = "Cluster membership monitor daemon", version)]
struct Args {
    /// Identity of this node; must appear in the candidate file.
    #[arg(short = 'n', long = "node-id", env = "CMM_NODE_ID")]
    node_id: u8,

    /// Candidate node file, one `<nodeid> <name> <host[:port]> <MEN|other>`
    /// line per node.
    #[arg(
        short = 'f',
        long = "config-file",
        env = "CMM_CONFIG_FILE",
        default_value = "/etc/cmm/cluster_nodes.conf"
    )]
    config_file: PathBuf,

    /// Log at debug level. The daemon always runs in the foreground;
    /// process supervision belongs to the init system.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Heartbeat interval in milliseconds.
    #[arg(long = "heartbeat-interval-ms", default_value_t = 1000)]
    heartbeat_interval_ms: u64,

    /// Silence bound in milliseconds before the successor is declared gone.
    #[arg(long = "heartbeat-timeout-ms", default_value_t = 4000)]
    heartbeat_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logging = startup::LoggingConfig::from_env();
    if args.debug {
        logging = logging.with_level(Level::DEBUG);
    }
    let _logging_guard = startup::init_logging(&logging)?;

    let timings = RingTimings {
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(args.heartbeat_timeout_ms),
        ..RingTimings::default()
    };
    let config = NodeConfig::new(args.node_id, args.config_file).with_timings(timings);

    info!(
        node = config.local_id,
        file = %config.config_file.display(),
        "starting cmm node"
    );
    let node = match CmmNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    // Mirror every membership change into the daemon log.
    node.handle()
        .register_listener(Arc::new(LoggingMembershipListener))
        .await;

    let shutdown = startup::wait_for_shutdown_signal();
    let mut signal = shutdown.subscribe();
    let _ = signal.recv().await;

    node.shutdown().await;
    Ok(())
}

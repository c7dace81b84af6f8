//! Node configuration: identity, candidate file location and ring timing
//! bounds.

use std::path::PathBuf;
use std::time::Duration;

use cmm_api::NodeId;

/// Timing bounds of the ring transport.
///
/// Every Lobby/Sender loop iteration completes at least once per
/// `heartbeat_interval` even with no network activity, which is what bounds
/// failure-reaction latency.
#[derive(Clone, Copy, Debug)]
pub struct RingTimings {
    /// How often the lobby writes HEARTBEAT frames to its predecessor.
    pub heartbeat_interval: Duration,
    /// Silence bound after which the successor is declared gone.
    pub heartbeat_timeout: Duration,
    /// Bound on one outgoing connection attempt during the successor scan
    /// and on handshake reads.
    pub connect_timeout: Duration,
}

impl Default for RingTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Startup configuration of one CMM daemon.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Identity of this node; must appear in the candidate file.
    pub local_id: NodeId,
    /// Candidate node file, one `<nodeid> <name> <host[:port]> <MEN|other>`
    /// line per node.
    pub config_file: PathBuf,
    pub timings: RingTimings,
}

impl NodeConfig {
    pub fn new(local_id: NodeId, config_file: impl Into<PathBuf>) -> Self {
        Self {
            local_id,
            config_file: config_file.into(),
            timings: RingTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: RingTimings) -> Self {
        self.timings = timings;
        self
    }
}

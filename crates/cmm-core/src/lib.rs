//! CMM core - the cluster membership monitor engine.
//!
//! A node runs three cooperating workers on one runtime:
//! - the Lobby accepts the ring predecessor and routes its frames,
//! - the RingSender keeps a connection to the nearest reachable successor
//!   and drains the outbound queues onto it,
//! - the Stack digests every protocol frame and local command, as the sole
//!   writer of the cluster node table.
//!
//! [`CmmNode::start`] wires the three together; [`CmmHandle`] is the local
//! API surface.

pub mod cluster;
pub mod config;
pub mod event;
pub mod handle;
pub mod node;
pub mod stack;
pub mod sync;
pub mod transport;

pub use cluster::{ClusterNodeTable, SharedTable};
pub use config::{NodeConfig, RingTimings};
pub use event::{EventFilter, EventPublisher, MembershipEvent, MembershipListener};
pub use handle::{CmmHandle, EventSubscription};
pub use node::CmmNode;

pub mod election;
pub mod table;

pub use election::{Action, ElectionEngine};
pub use table::{ClusterNodeTable, SharedTable, ring_cmp};

//! CMM Common - shared error types for the cluster membership monitor
//!
//! Every crate in the workspace reports failures through [`CmmError`]; the
//! variants map one-to-one onto the recovery strategies of the daemon
//! (reconnect, drop the connection, abort startup, report to the caller).

pub mod error;

pub use error::{CmmError, Result};

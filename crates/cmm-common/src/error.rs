//! Error types for the cluster membership monitor
//!
//! Errors are grouped by how they are recovered, not by where they occur:
//! - `Connection`: a ring hop is unreachable; torn down and re-established.
//! - `Protocol`: an unexpected or malformed frame; the offending connection
//!   is dropped with no cluster-wide effect.
//! - `Config` / `Resource`: fatal at startup, the node cannot participate.
//! - `IllegalState`: returned to the local API caller; never generates wire
//!   traffic.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum CmmError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("node {0} not found in cluster node table")]
    UnknownNode(u8),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl CmmError {
    /// True for errors recovered by tearing down and re-establishing a hop.
    pub fn is_connection(&self) -> bool {
        matches!(self, CmmError::Connection(_))
    }
}

impl From<std::io::Error> for CmmError {
    fn from(e: std::io::Error) -> Self {
        CmmError::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CmmError>;

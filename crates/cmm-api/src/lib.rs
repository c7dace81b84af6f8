//! CMM API - wire protocol model and frame codec
//!
//! This crate defines:
//! - The member record and status bitmask shared by every component
//! - The `Frame` sum type (header + typed payload) exchanged on ring hops
//! - The binary codec: in-memory encode/decode plus bounded stream send/receive

pub mod codec;
pub mod frame;
pub mod model;

pub use codec::{decode, encode, recv_frame, send_frame};
pub use frame::{Dest, Frame, Payload};
pub use model::{
    ChangeKind, Member, MemberFlags, NodeId, Office, QualifState, QueryKind, RegisterAnswer,
};

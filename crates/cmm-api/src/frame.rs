//! The unit of wire communication: a fixed 3-byte header plus a typed
//! payload. The payload is a sum type so an illegal type/payload pairing is
//! unrepresentable.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use cmm_common::{CmmError, Result};

use crate::model::{ChangeKind, Member, NodeId, Office, QualifState, QueryKind};

/// Destination of a frame. `NextOnly` frames are consumed by the next hop;
/// `Broadcast` frames travel once around the ring and die at their
/// originator; a specific id is unicast and forwarded hop by hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dest {
    NextOnly,
    Broadcast,
    Node(NodeId),
}

impl Dest {
    pub const NEXT_ONLY_WIRE: u8 = 0x00;
    pub const BROADCAST_WIRE: u8 = 0xFF;

    pub fn as_wire(self) -> u8 {
        match self {
            Dest::NextOnly => Self::NEXT_ONLY_WIRE,
            Dest::Broadcast => Self::BROADCAST_WIRE,
            Dest::Node(id) => id,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            Self::NEXT_ONLY_WIRE => Dest::NextOnly,
            Self::BROADCAST_WIRE => Dest::Broadcast,
            id => Dest::Node(id),
        }
    }
}

/// Typed frame payload; one variant per wire frame type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Register {
        answer: u8,
    },
    Disconnect,
    Heartbeat,
    NodeChange {
        left: bool,
        node: NodeId,
    },
    Election {
        office: Office,
        request: bool,
        elected: NodeId,
    },
    Notification {
        kind: ChangeKind,
        node: NodeId,
    },
    GetMemberInfo {
        query: QueryKind,
        target: NodeId,
        members: Vec<Member>,
    },
    MastershipRelease {
        result: u8,
    },
    QualifChange {
        node: NodeId,
        state: QualifState,
        request: bool,
        result: u8,
    },
}

impl Payload {
    pub const REGISTER: u8 = 0x01;
    pub const DISCONNECT: u8 = 0x02;
    pub const HEARTBEAT: u8 = 0x03;
    pub const NODE_CHANGE: u8 = 0x04;
    pub const ELECTION: u8 = 0x05;
    pub const NOTIFICATION: u8 = 0x06;
    pub const GET_MEMBER_INFO: u8 = 0x07;
    pub const MASTERSHIP_RELEASE: u8 = 0x08;
    pub const QUALIF_CHANGE: u8 = 0x09;

    /// Wire type tag of this payload.
    pub fn tag(&self) -> u8 {
        match self {
            Payload::Register { .. } => Self::REGISTER,
            Payload::Disconnect => Self::DISCONNECT,
            Payload::Heartbeat => Self::HEARTBEAT,
            Payload::NodeChange { .. } => Self::NODE_CHANGE,
            Payload::Election { .. } => Self::ELECTION,
            Payload::Notification { .. } => Self::NOTIFICATION,
            Payload::GetMemberInfo { .. } => Self::GET_MEMBER_INFO,
            Payload::MastershipRelease { .. } => Self::MASTERSHIP_RELEASE,
            Payload::QualifChange { .. } => Self::QUALIF_CHANGE,
        }
    }

    pub fn tag_name(tag: u8) -> &'static str {
        match tag {
            Self::REGISTER => "REGISTER",
            Self::DISCONNECT => "DISCONNECT",
            Self::HEARTBEAT => "HEARTBEAT",
            Self::NODE_CHANGE => "NODE_CHANGE",
            Self::ELECTION => "ELECTION",
            Self::NOTIFICATION => "NOTIFICATION",
            Self::GET_MEMBER_INFO => "GET_MEMBER_INFO",
            Self::MASTERSHIP_RELEASE => "MASTERSHIP_RELEASE",
            Self::QUALIF_CHANGE => "QUALIF_CHANGE",
            _ => "UNKNOWN",
        }
    }
}

/// A frame as it travels one ring hop. `sender` is the originating node, not
/// the forwarding node: it is how the lobby recognizes that a broadcast has
/// completed its loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: NodeId,
    pub dest: Dest,
    pub payload: Payload,
}

impl Frame {
    pub fn new(sender: NodeId, dest: Dest, payload: Payload) -> Self {
        Self {
            sender,
            dest,
            payload,
        }
    }

    pub fn heartbeat(sender: NodeId, dest: NodeId) -> Self {
        Frame::new(sender, Dest::Node(dest), Payload::Heartbeat)
    }

    pub fn disconnect(sender: NodeId, dest: NodeId) -> Self {
        Frame::new(sender, Dest::Node(dest), Payload::Disconnect)
    }

    pub fn register(sender: NodeId, dest: NodeId, answer: u8) -> Self {
        Frame::new(sender, Dest::Node(dest), Payload::Register { answer })
    }

    pub fn node_change(sender: NodeId, left: bool, node: NodeId) -> Self {
        Frame::new(sender, Dest::Broadcast, Payload::NodeChange { left, node })
    }

    pub fn election_bid(sender: NodeId, office: Office, elected: NodeId) -> Self {
        Frame::new(
            sender,
            Dest::NextOnly,
            Payload::Election {
                office,
                request: true,
                elected,
            },
        )
    }

    pub fn election_notification(sender: NodeId, office: Office, elected: NodeId) -> Self {
        Frame::new(
            sender,
            Dest::Broadcast,
            Payload::Election {
                office,
                request: false,
                elected,
            },
        )
    }

    /// The register answer, when this frame is a registration frame.
    pub fn register_answer(&self) -> Result<u8> {
        match self.payload {
            Payload::Register { answer } => Ok(answer),
            ref other => Err(CmmError::Protocol(format!(
                "expected REGISTER during handshake, got {}",
                Payload::tag_name(other.tag())
            ))),
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{} -> {:?}]",
            Payload::tag_name(self.payload.tag()),
            self.sender,
            self.dest
        )
    }
}

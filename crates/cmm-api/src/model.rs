//! Shared protocol model: node identifiers, member records, status flags
//! and the enumerations carried inside frames.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use cmm_common::{CmmError, Result};

/// Cluster node identifier. Valid ids are 1..=254; 0x00 and 0xFF are the
/// NEXT_ONLY and BROADCAST destination sentinels on the wire.
pub type NodeId = u8;

/// Smallest valid node id.
pub const MIN_NODE_ID: NodeId = 1;
/// Largest valid node id.
pub const MAX_NODE_ID: NodeId = 254;

/// Default TCP port for ring hops when the config file gives a bare hostname.
pub const DEFAULT_RING_PORT: u16 = 9550;

/// Software load identifier reported by every node of this build.
pub const DEFAULT_SOFTWARE_LOAD: u32 = 1;

/// Per-member status bitmask, transferred as a raw `u32` in member-info
/// payloads. At most one in-cluster node carries `MASTER` and at most one
/// carries `VICEMASTER` outside transient election windows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberFlags(u32);

impl MemberFlags {
    pub const MASTER: u32 = 1 << 0;
    pub const VICEMASTER: u32 = 1 << 1;
    pub const OUT_OF_CLUSTER: u32 = 1 << 2;
    pub const FROZEN: u32 = 1 << 3;
    pub const EXCLUDED: u32 = 1 << 4;
    pub const ELIGIBLE: u32 = 1 << 5;
    pub const DISQUALIFIED: u32 = 1 << 6;
    pub const SYNCHRO_NEEDED: u32 = 1 << 7;

    pub const fn empty() -> Self {
        MemberFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        MemberFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    /// True when the node currently participates in the ring.
    pub fn in_cluster(self) -> bool {
        !self.contains(Self::OUT_OF_CLUSTER)
    }

    /// True when the node may hold an office right now.
    pub fn can_hold_office(self) -> bool {
        self.contains(Self::ELIGIBLE)
            && !self.contains(Self::DISQUALIFIED)
            && !self.contains(Self::FROZEN)
            && self.in_cluster()
    }
}

impl Display for MemberFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(u32, &str); 8] = [
            (MemberFlags::MASTER, "MASTER"),
            (MemberFlags::VICEMASTER, "VICEMASTER"),
            (MemberFlags::OUT_OF_CLUSTER, "OUT_OF_CLUSTER"),
            (MemberFlags::FROZEN, "FROZEN"),
            (MemberFlags::EXCLUDED, "EXCLUDED"),
            (MemberFlags::ELIGIBLE, "ELIGIBLE"),
            (MemberFlags::DISQUALIFIED, "DISQUALIFIED"),
            (MemberFlags::SYNCHRO_NEEDED, "SYNCHRO_NEEDED"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// One candidate node of the cluster.
///
/// Created from the config file at startup and never destroyed: nodes that
/// leave are flagged `OUT_OF_CLUSTER`, not removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub name: String,
    pub addr: SocketAddr,
    pub domain: u8,
    pub flags: MemberFlags,
    pub incarnation: u32,
    pub load_id: u32,
}

impl Member {
    pub fn new(id: NodeId, name: String, addr: SocketAddr) -> Self {
        Self {
            id,
            name,
            addr,
            domain: 0,
            flags: MemberFlags::empty(),
            incarnation: 0,
            load_id: DEFAULT_SOFTWARE_LOAD,
        }
    }

    pub fn is_master(&self) -> bool {
        self.flags.contains(MemberFlags::MASTER)
    }

    pub fn is_vicemaster(&self) -> bool {
        self.flags.contains(MemberFlags::VICEMASTER)
    }

    pub fn holds(&self, office: Office) -> bool {
        self.flags.contains(office.flag())
    }
}

/// Leadership office.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Office {
    Master,
    ViceMaster,
}

impl Office {
    pub const ALL: [Office; 2] = [Office::Master, Office::ViceMaster];

    pub fn flag(self) -> u32 {
        match self {
            Office::Master => MemberFlags::MASTER,
            Office::ViceMaster => MemberFlags::VICEMASTER,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Office::Master => 0,
            Office::ViceMaster => 1,
        }
    }

    pub fn other(self) -> Office {
        match self {
            Office::Master => Office::ViceMaster,
            Office::ViceMaster => Office::Master,
        }
    }

    pub fn as_wire(self) -> u8 {
        self.index() as u8
    }

    pub fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Office::Master),
            1 => Ok(Office::ViceMaster),
            other => Err(CmmError::Protocol(format!("unknown office tag {other}"))),
        }
    }
}

impl Display for Office {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Office::Master => write!(f, "MASTER"),
            Office::ViceMaster => write!(f, "VICEMASTER"),
        }
    }
}

/// Kind of membership change carried by notification frames and surfaced
/// through the push-notification API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    NodeJoined,
    NodeLeft,
    MasterElected,
    ViceMasterElected,
    MastershipReleased,
    Qualified,
    Disqualified,
}

impl ChangeKind {
    /// Bit used by notification filter masks.
    pub fn bit(self) -> u32 {
        1 << self.as_wire()
    }

    pub fn as_wire(self) -> u8 {
        match self {
            ChangeKind::NodeJoined => 0,
            ChangeKind::NodeLeft => 1,
            ChangeKind::MasterElected => 2,
            ChangeKind::ViceMasterElected => 3,
            ChangeKind::MastershipReleased => 4,
            ChangeKind::Qualified => 5,
            ChangeKind::Disqualified => 6,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ChangeKind::NodeJoined),
            1 => Ok(ChangeKind::NodeLeft),
            2 => Ok(ChangeKind::MasterElected),
            3 => Ok(ChangeKind::ViceMasterElected),
            4 => Ok(ChangeKind::MastershipReleased),
            5 => Ok(ChangeKind::Qualified),
            6 => Ok(ChangeKind::Disqualified),
            other => Err(CmmError::Protocol(format!(
                "unknown change kind tag {other}"
            ))),
        }
    }

    pub fn elected(office: Office) -> Self {
        match office {
            Office::Master => ChangeKind::MasterElected,
            Office::ViceMaster => ChangeKind::ViceMasterElected,
        }
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::NodeJoined => write!(f, "NODE_JOINED"),
            ChangeKind::NodeLeft => write!(f, "NODE_LEFT"),
            ChangeKind::MasterElected => write!(f, "MASTER_ELECTED"),
            ChangeKind::ViceMasterElected => write!(f, "VICEMASTER_ELECTED"),
            ChangeKind::MastershipReleased => write!(f, "MASTERSHIP_RELEASED"),
            ChangeKind::Qualified => write!(f, "QUALIFIED"),
            ChangeKind::Disqualified => write!(f, "DISQUALIFIED"),
        }
    }
}

/// Soft-exclusion state targeted by qualification changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualifState {
    Qualified,
    Disqualified,
}

impl QualifState {
    pub fn as_wire(self) -> u8 {
        match self {
            QualifState::Qualified => 0,
            QualifState::Disqualified => 1,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(QualifState::Qualified),
            1 => Ok(QualifState::Disqualified),
            other => Err(CmmError::Protocol(format!(
                "unknown qualification state tag {other}"
            ))),
        }
    }
}

/// Query discriminator of member-info payloads. `StatePush` is the unicast
/// reply a node sends toward a rejoining peer so its table converges without
/// waiting a full ring rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    StatePush,
}

impl QueryKind {
    pub fn as_wire(self) -> u8 {
        match self {
            QueryKind::StatePush => 0,
        }
    }

    pub fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(QueryKind::StatePush),
            other => Err(CmmError::Protocol(format!("unknown query kind tag {other}"))),
        }
    }
}

/// Registration handshake answers.
pub struct RegisterAnswer;

impl RegisterAnswer {
    pub const REQUEST: u8 = 0;
    pub const ACCEPTED: u8 = 1;
    pub const REJECTED: u8 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_insert_remove() {
        let mut flags = MemberFlags::empty();
        assert!(flags.in_cluster());

        flags.insert(MemberFlags::ELIGIBLE);
        flags.insert(MemberFlags::OUT_OF_CLUSTER);
        assert!(flags.contains(MemberFlags::ELIGIBLE));
        assert!(!flags.in_cluster());
        assert!(!flags.can_hold_office());

        flags.remove(MemberFlags::OUT_OF_CLUSTER);
        assert!(flags.can_hold_office());

        flags.insert(MemberFlags::DISQUALIFIED);
        assert!(!flags.can_hold_office());
    }

    #[test]
    fn test_flags_display() {
        let mut flags = MemberFlags::empty();
        assert_eq!(flags.to_string(), "-");
        flags.insert(MemberFlags::MASTER);
        flags.insert(MemberFlags::ELIGIBLE);
        assert_eq!(flags.to_string(), "MASTER|ELIGIBLE");
    }

    #[test]
    fn test_office_round_trip() {
        for office in Office::ALL {
            assert_eq!(Office::from_wire(office.as_wire()).unwrap(), office);
        }
        assert!(Office::from_wire(9).is_err());
        assert_eq!(Office::Master.other(), Office::ViceMaster);
    }

    #[test]
    fn test_change_kind_round_trip() {
        for kind in [
            ChangeKind::NodeJoined,
            ChangeKind::NodeLeft,
            ChangeKind::MasterElected,
            ChangeKind::ViceMasterElected,
            ChangeKind::MastershipReleased,
            ChangeKind::Qualified,
            ChangeKind::Disqualified,
        ] {
            assert_eq!(ChangeKind::from_wire(kind.as_wire()).unwrap(), kind);
        }
        assert!(ChangeKind::from_wire(200).is_err());
    }
}

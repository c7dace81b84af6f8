//! The cluster node table: the sorted, in-memory roster of candidate nodes.
//!
//! Built once from the candidate file at startup (fatal on any failure) and
//! mutated only by the Stack dispatcher afterwards; Lobby and Sender take
//! read snapshots. Nodes are never removed: leaving the cluster flips the
//! OUT_OF_CLUSTER flag.

use std::cmp::Ordering;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use cmm_api::model::{DEFAULT_RING_PORT, MAX_NODE_ID, MIN_NODE_ID};
use cmm_api::{Member, MemberFlags, NodeId, Office};
use cmm_common::{CmmError, Result};

/// Role column value marking a node as eligible for office.
const ELIGIBLE_ROLE: &str = "MEN";

/// Table shared across the three workers; the Stack is the only writer.
pub type SharedTable = Arc<RwLock<ClusterNodeTable>>;

/// Clockwise ring order relative to `local`: ids at or above the local id
/// come first in ascending order, then the wrapped-around ids below it.
/// Every node computes a rotation of the same cyclic sequence, which is what
/// makes "ring-distance 1" mean the same successor everywhere.
pub fn ring_cmp(local: NodeId, a: NodeId, b: NodeId) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if a >= local && b < local {
        Ordering::Less
    } else if b >= local && a < local {
        Ordering::Greater
    } else {
        a.cmp(&b)
    }
}

#[derive(Debug)]
pub struct ClusterNodeTable {
    local_id: NodeId,
    members: Vec<Member>,
}

impl ClusterNodeTable {
    /// Build the table from the candidate file. Startup-only; any parse or
    /// resolution failure aborts the whole startup.
    pub fn load(path: &Path, local_id: NodeId) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            CmmError::Config(format!("cannot read candidate file {}: {e}", path.display()))
        })?;
        let mut members = Vec::new();

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let member = parse_line(line)
                .map_err(|e| CmmError::Config(format!("{}:{}: {e}", path.display(), lineno + 1)))?;
            if members.iter().any(|m: &Member| m.id == member.id) {
                return Err(CmmError::Config(format!(
                    "{}:{}: duplicate node id {}",
                    path.display(),
                    lineno + 1,
                    member.id
                )));
            }
            debug!(node = member.id, name = %member.name, addr = %member.addr, "candidate node");
            members.push(member);
        }

        if !members.iter().any(|m| m.id == local_id) {
            return Err(CmmError::Config(format!(
                "local node {local_id} does not appear in {}",
                path.display()
            )));
        }

        // Everyone starts outside the cluster except ourselves; membership
        // is learned from the ring, not assumed from the file.
        for member in &mut members {
            if member.id != local_id {
                member.flags.insert(MemberFlags::OUT_OF_CLUSTER);
            }
        }

        members.sort_by(|a, b| ring_cmp(local_id, a.id, b.id));
        info!(
            local = local_id,
            candidates = members.len(),
            "cluster node table loaded"
        );
        Ok(Self { local_id, members })
    }

    /// Build a table from pre-resolved members (tests and state merges).
    pub fn from_members(local_id: NodeId, mut members: Vec<Member>) -> Self {
        members.sort_by(|a, b| ring_cmp(local_id, a.id, b.id));
        Self { local_id, members }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The local node; always index 0.
    pub fn local(&self) -> &Member {
        &self.members[0]
    }

    pub fn get(&self, index: usize) -> Option<&Member> {
        self.members.get(index)
    }

    pub fn get_by_id(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn get_by_id_mut(&mut self, id: NodeId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    /// Clockwise ring distance of `id` from the local node, i.e. its table
    /// index.
    pub fn distance(&self, id: NodeId) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn office_holder(&self, office: Office) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.holds(office) && m.flags.in_cluster())
    }

    pub fn master(&self) -> Option<&Member> {
        self.office_holder(Office::Master)
    }

    pub fn vicemaster(&self) -> Option<&Member> {
        self.office_holder(Office::ViceMaster)
    }

    pub fn local_holds(&self, office: Office) -> bool {
        self.local().holds(office)
    }

    pub fn local_holds_any_office(&self) -> bool {
        Office::ALL.iter().any(|&o| self.local_holds(o))
    }

    pub(crate) fn local_mut(&mut self) -> &mut Member {
        &mut self.members[0]
    }
}

fn parse_line(line: &str) -> Result<Member> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(CmmError::Config(format!(
            "expected '<nodeid> <name> <host[:port]> <MEN|other>', got '{line}'"
        )));
    }

    let id: NodeId = fields[0]
        .parse()
        .map_err(|_| CmmError::Config(format!("invalid node id '{}'", fields[0])))?;
    if !(MIN_NODE_ID..=MAX_NODE_ID).contains(&id) {
        return Err(CmmError::Config(format!(
            "node id {id} outside {MIN_NODE_ID}..={MAX_NODE_ID}"
        )));
    }

    let name = fields[1].to_string();
    if name.len() > u8::MAX as usize {
        return Err(CmmError::Config(format!("node name '{name}' too long")));
    }

    let addr = resolve(fields[2])?;

    let mut member = Member::new(id, name, addr);
    if fields[3] == ELIGIBLE_ROLE {
        member.flags.insert(MemberFlags::ELIGIBLE);
    }
    Ok(member)
}

/// Resolve `host[:port]` to the first reported address; the default ring
/// port applies when the file gives a bare hostname.
fn resolve(host: &str) -> Result<SocketAddr> {
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_RING_PORT}")
    };
    target
        .to_socket_addrs()
        .map_err(|e| CmmError::Config(format!("cannot resolve '{host}': {e}")))?
        .next()
        .ok_or_else(|| CmmError::Config(format!("'{host}' resolved to no addresses")))
}

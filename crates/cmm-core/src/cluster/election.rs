//! Token-passing leader election and qualification state machine.
//!
//! A bid is a unicast ELECTION request hopping one node at a time; when it
//! returns to its originator the originator declares itself elected and
//! floods an ELECTION notification once around the ring. Ties always break
//! toward the lower node id. Qualification is a soft exclusion independent
//! of eligibility: a disqualified node cannot hold office until re-qualified.
//!
//! The engine is pure state: it mutates the cluster node table and returns
//! the frames to enqueue and the events to publish. Only the Stack
//! dispatcher drives it, which is what keeps table mutation single-writer.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use cmm_api::{
    ChangeKind, Dest, Frame, MemberFlags, NodeId, Office, Payload, QualifState, QueryKind,
};
use cmm_common::{CmmError, Result};

use super::table::ClusterNodeTable;

/// Qualification change applied without incident.
const QUALIF_OK: u8 = 0;

/// Mastership released without incident.
const RELEASE_OK: u8 = 0;

/// What the engine wants done after digesting an input.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Enqueue a locally originated frame for the successor.
    Send(Frame),
    /// Surface a membership event to local subscribers.
    Publish(ChangeKind, NodeId),
}

pub struct ElectionEngine {
    local_id: NodeId,
    /// One outstanding bid per office, stamped with when it went out;
    /// cleared when the office is decided or falls vacant again.
    bid_in_flight: [Option<Instant>; 2],
}

impl ElectionEngine {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            bid_in_flight: [None; 2],
        }
    }

    /// Periodic retry. A bid token travels hop by hop and dies with any hop
    /// that fails while it circulates; when the office is still vacant after
    /// `rebid_after`, the token is presumed lost and the bid restarts.
    pub fn tick(&mut self, table: &ClusterNodeTable, rebid_after: Duration) -> Vec<Action> {
        for office in Office::ALL {
            if let Some(started) = self.bid_in_flight[office.index()]
                && started.elapsed() > rebid_after
                && table.office_holder(office).is_none()
            {
                debug!(%office, "bid token presumed lost");
                self.bid_in_flight[office.index()] = None;
            }
        }
        self.maybe_bid(table)
    }

    /// Initial bid check. A lone node still has to seize the vacant offices:
    /// its join broadcast dies at its own lobby and triggers nothing.
    pub fn startup(&mut self, table: &ClusterNodeTable) -> Vec<Action> {
        self.maybe_bid(table)
    }

    /// Digest a NODE_CHANGE observed on the ring. Re-processing a duplicate
    /// is a no-op: membership flags are checked before any side effect.
    pub fn handle_node_change(
        &mut self,
        table: &mut ClusterNodeTable,
        left: bool,
        node: NodeId,
    ) -> Vec<Action> {
        if node == self.local_id {
            return Vec::new();
        }
        let Some(member) = table.get_by_id_mut(node) else {
            warn!(node, "node change for unknown node");
            return Vec::new();
        };

        let mut actions = Vec::new();
        if left {
            if !member.flags.in_cluster() {
                return Vec::new();
            }
            member.flags.insert(MemberFlags::OUT_OF_CLUSTER);
            let held: Vec<Office> = Office::ALL
                .into_iter()
                .filter(|&o| member.holds(o))
                .collect();
            for office in &held {
                member.flags.remove(office.flag());
            }
            debug!(node, offices = held.len(), "node left the cluster");
            actions.push(Action::Publish(ChangeKind::NodeLeft, node));
            for office in held {
                self.bid_in_flight[office.index()] = None;
            }
            actions.extend(self.maybe_bid(table));
        } else {
            if member.flags.in_cluster() {
                return Vec::new();
            }
            member.flags.remove(MemberFlags::OUT_OF_CLUSTER);
            member.flags.insert(MemberFlags::SYNCHRO_NEEDED);
            member.incarnation += 1;
            debug!(node, "node joined the cluster");
            actions.push(Action::Publish(ChangeKind::NodeJoined, node));
            // Unicast our own state so the joiner's table converges without
            // waiting a full ring rotation.
            let own = table.local().clone();
            actions.push(Action::Send(Frame::new(
                self.local_id,
                Dest::Node(node),
                Payload::GetMemberInfo {
                    query: QueryKind::StatePush,
                    target: node,
                    members: vec![own],
                },
            )));
            actions.extend(self.maybe_bid(table));
        }
        actions
    }

    /// Digest an ELECTION frame.
    pub fn handle_election(
        &mut self,
        table: &mut ClusterNodeTable,
        office: Office,
        request: bool,
        elected: NodeId,
    ) -> Vec<Action> {
        if request {
            self.handle_election_request(table, office, elected)
        } else {
            self.handle_election_notification(table, office, elected)
        }
    }

    fn handle_election_request(
        &mut self,
        table: &mut ClusterNodeTable,
        office: Office,
        elected: NodeId,
    ) -> Vec<Action> {
        if elected == self.local_id {
            // Our own bid made it around the ring.
            return self.declare_elected(table, office);
        }

        let Some(bidder) = table.get_by_id(elected) else {
            warn!(bidder = elected, "election bid from unknown node, dropped");
            return Vec::new();
        };
        if bidder.flags.contains(MemberFlags::DISQUALIFIED) {
            // A disqualified bidder does not learn it is disqualified by
            // silence; tell it directly instead of forwarding the bid.
            debug!(bidder = elected, %office, "bid from disqualified node");
            return vec![Action::Send(Frame::new(
                self.local_id,
                Dest::Node(elected),
                Payload::QualifChange {
                    node: elected,
                    state: QualifState::Disqualified,
                    request: true,
                    result: QUALIF_OK,
                },
            ))];
        }

        if table.local_holds(office) {
            if self.local_id < elected {
                // Already decided in our favor; re-assert instead of letting
                // a stale vacancy observation circulate.
                return vec![Action::Send(Frame::election_notification(
                    self.local_id,
                    office,
                    self.local_id,
                ))];
            }
            // The lower-numbered bidder will win; we yield once its
            // notification arrives. Let the bid continue.
            return vec![Action::Send(Frame::election_bid(
                self.local_id,
                office,
                elected,
            ))];
        }

        if self.is_better_candidate(table, office, elected) {
            debug!(bidder = elected, %office, "dropping bid from worse candidate");
            // Our own bid for the same vacancy wins the race instead.
            return self.maybe_bid(table);
        }

        vec![Action::Send(Frame::election_bid(
            self.local_id,
            office,
            elected,
        ))]
    }

    fn handle_election_notification(
        &mut self,
        table: &mut ClusterNodeTable,
        office: Office,
        elected: NodeId,
    ) -> Vec<Action> {
        self.bid_in_flight[office.index()] = None;
        if elected == self.local_id {
            // A peer re-asserted us; our flag is already set.
            return Vec::new();
        }
        if table.local_holds(office) && self.local_id < elected {
            // Lower node id always wins: keep the office and re-assert.
            debug!(claimed = elected, %office, "outranking claimed winner, re-asserting");
            return vec![Action::Send(Frame::election_notification(
                self.local_id,
                office,
                self.local_id,
            ))];
        }
        self.apply_claim(table, office, elected)
    }

    /// Digest a NOTIFICATION frame (qualification floods).
    pub fn handle_notification(
        &mut self,
        table: &mut ClusterNodeTable,
        kind: ChangeKind,
        node: NodeId,
    ) -> Vec<Action> {
        match kind {
            ChangeKind::Qualified => self.apply_remote_qualif(table, node, QualifState::Qualified),
            ChangeKind::Disqualified => {
                self.apply_remote_qualif(table, node, QualifState::Disqualified)
            }
            other => {
                debug!(%other, node, "ignoring notification kind");
                Vec::new()
            }
        }
    }

    /// Digest a MASTERSHIP_RELEASE announcement: `from` gave up whatever
    /// office it held.
    pub fn handle_release_announcement(
        &mut self,
        table: &mut ClusterNodeTable,
        from: NodeId,
    ) -> Vec<Action> {
        if from == self.local_id {
            return Vec::new();
        }
        let Some(member) = table.get_by_id_mut(from) else {
            warn!(node = from, "release announcement from unknown node");
            return Vec::new();
        };
        let held: Vec<Office> = Office::ALL
            .into_iter()
            .filter(|&o| member.holds(o))
            .collect();
        if held.is_empty() {
            return Vec::new();
        }
        for office in &held {
            member.flags.remove(office.flag());
            self.bid_in_flight[office.index()] = None;
        }
        let mut actions = vec![Action::Publish(ChangeKind::MastershipReleased, from)];
        actions.extend(self.maybe_bid(table));
        actions
    }

    /// Digest a QUALIF_CHANGE frame.
    pub fn handle_qualif_change(
        &mut self,
        table: &mut ClusterNodeTable,
        origin: NodeId,
        node: NodeId,
        state: QualifState,
        request: bool,
    ) -> Vec<Action> {
        if !request {
            // Result/notification: just converge the flag.
            return self.apply_remote_qualif(table, node, state);
        }
        if node == self.local_id {
            return self.apply_local_qualif(table, state, Some(origin));
        }
        // Requested for a remote node: forward unicast toward the target.
        vec![Action::Send(Frame::new(
            self.local_id,
            Dest::Node(node),
            Payload::QualifChange {
                node,
                state,
                request: true,
                result: QUALIF_OK,
            },
        ))]
    }

    /// Merge a member-info state push from `members` (each entry is the
    /// sending node's own record).
    pub fn handle_member_info(
        &mut self,
        table: &mut ClusterNodeTable,
        members: Vec<cmm_api::Member>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut claims: Vec<(Office, NodeId)> = Vec::new();

        for info in members {
            if info.id == self.local_id {
                continue;
            }
            let Some(member) = table.get_by_id_mut(info.id) else {
                warn!(node = info.id, "state push for unknown node");
                continue;
            };
            let was_out = !member.flags.in_cluster();
            member.flags.remove(MemberFlags::OUT_OF_CLUSTER);
            member.flags.remove(MemberFlags::SYNCHRO_NEEDED);
            for bit in [MemberFlags::ELIGIBLE, MemberFlags::DISQUALIFIED] {
                if info.flags.contains(bit) {
                    member.flags.insert(bit);
                } else {
                    member.flags.remove(bit);
                }
            }
            member.incarnation = member.incarnation.max(info.incarnation);
            member.domain = info.domain;
            member.load_id = info.load_id;
            if was_out {
                actions.push(Action::Publish(ChangeKind::NodeJoined, info.id));
            }
            for office in Office::ALL {
                if info.flags.contains(office.flag()) {
                    claims.push((office, info.id));
                }
            }
        }

        // Office claims go through the same lower-id-wins path as election
        // notifications.
        for (office, claimant) in claims {
            if table.local_holds(office) && self.local_id < claimant {
                actions.push(Action::Send(Frame::election_notification(
                    self.local_id,
                    office,
                    self.local_id,
                )));
                continue;
            }
            actions.extend(self.apply_claim(table, office, claimant));
        }
        actions.extend(self.maybe_bid(table));
        actions
    }

    /// Local API: give up mastership voluntarily.
    pub fn local_release(&mut self, table: &mut ClusterNodeTable) -> Result<Vec<Action>> {
        if !table.local_holds(Office::Master) {
            return Err(CmmError::IllegalState(
                "not the current master".to_string(),
            ));
        }
        let local = table.local_mut();
        local.flags.remove(MemberFlags::MASTER);
        // Stay out of the election we are about to trigger; the freeze ends
        // when another node's claim is applied.
        local.flags.insert(MemberFlags::FROZEN);
        self.bid_in_flight[Office::Master.index()] = None;
        Ok(vec![
            Action::Publish(ChangeKind::MastershipReleased, self.local_id),
            Action::Send(Frame::new(
                self.local_id,
                Dest::Broadcast,
                Payload::MastershipRelease { result: RELEASE_OK },
            )),
        ])
    }

    /// Local API: change a node's qualification state.
    pub fn local_set_qualif(
        &mut self,
        table: &mut ClusterNodeTable,
        node: NodeId,
        state: QualifState,
    ) -> Result<Vec<Action>> {
        if node == self.local_id {
            return Ok(self.apply_local_qualif(table, state, None));
        }
        if table.get_by_id(node).is_none() {
            return Err(CmmError::UnknownNode(node));
        }
        Ok(vec![Action::Send(Frame::new(
            self.local_id,
            Dest::Node(node),
            Payload::QualifChange {
                node,
                state,
                request: true,
                result: QUALIF_OK,
            },
        ))])
    }

    fn apply_local_qualif(
        &mut self,
        table: &mut ClusterNodeTable,
        state: QualifState,
        reply_to: Option<NodeId>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let disqualified = table.local().flags.contains(MemberFlags::DISQUALIFIED);

        match state {
            QualifState::Disqualified if !disqualified => {
                table.local_mut().flags.insert(MemberFlags::DISQUALIFIED);
                actions.push(Action::Publish(ChangeKind::Disqualified, self.local_id));
                actions.push(Action::Send(Frame::new(
                    self.local_id,
                    Dest::Broadcast,
                    Payload::Notification {
                        kind: ChangeKind::Disqualified,
                        node: self.local_id,
                    },
                )));
                // An office cannot be held while disqualified.
                let held: Vec<Office> = Office::ALL
                    .into_iter()
                    .filter(|&o| table.local_holds(o))
                    .collect();
                if !held.is_empty() {
                    for office in &held {
                        table.local_mut().flags.remove(office.flag());
                        self.bid_in_flight[office.index()] = None;
                    }
                    actions.push(Action::Publish(
                        ChangeKind::MastershipReleased,
                        self.local_id,
                    ));
                    actions.push(Action::Send(Frame::new(
                        self.local_id,
                        Dest::Broadcast,
                        Payload::MastershipRelease { result: RELEASE_OK },
                    )));
                }
            }
            QualifState::Qualified if disqualified => {
                let local = table.local_mut();
                local.flags.remove(MemberFlags::DISQUALIFIED);
                local.flags.remove(MemberFlags::FROZEN);
                actions.push(Action::Publish(ChangeKind::Qualified, self.local_id));
                actions.push(Action::Send(Frame::new(
                    self.local_id,
                    Dest::Broadcast,
                    Payload::Notification {
                        kind: ChangeKind::Qualified,
                        node: self.local_id,
                    },
                )));
                actions.extend(self.maybe_bid(table));
            }
            // Already in the requested state.
            _ => {}
        }

        if let Some(origin) = reply_to
            && origin != self.local_id
        {
            actions.push(Action::Send(Frame::new(
                self.local_id,
                Dest::Node(origin),
                Payload::QualifChange {
                    node: self.local_id,
                    state,
                    request: false,
                    result: QUALIF_OK,
                },
            )));
        }
        actions
    }

    fn apply_remote_qualif(
        &mut self,
        table: &mut ClusterNodeTable,
        node: NodeId,
        state: QualifState,
    ) -> Vec<Action> {
        if node == self.local_id {
            // Authoritative changes to our own state arrive as requests.
            return Vec::new();
        }
        let Some(member) = table.get_by_id_mut(node) else {
            warn!(node, "qualification change for unknown node");
            return Vec::new();
        };

        let mut actions = Vec::new();
        match state {
            QualifState::Disqualified => {
                if member.flags.contains(MemberFlags::DISQUALIFIED) {
                    return Vec::new();
                }
                member.flags.insert(MemberFlags::DISQUALIFIED);
                let held: Vec<Office> = Office::ALL
                    .into_iter()
                    .filter(|&o| member.holds(o))
                    .collect();
                for office in &held {
                    member.flags.remove(office.flag());
                    self.bid_in_flight[office.index()] = None;
                }
                actions.push(Action::Publish(ChangeKind::Disqualified, node));
                actions.extend(self.maybe_bid(table));
            }
            QualifState::Qualified => {
                if !member.flags.contains(MemberFlags::DISQUALIFIED) {
                    return Vec::new();
                }
                member.flags.remove(MemberFlags::DISQUALIFIED);
                actions.push(Action::Publish(ChangeKind::Qualified, node));
            }
        }
        actions
    }

    /// Declare ourselves elected after our bid returned.
    fn declare_elected(&mut self, table: &mut ClusterNodeTable, office: Office) -> Vec<Action> {
        self.bid_in_flight[office.index()] = None;
        if table.local_holds(office) {
            return Vec::new();
        }
        if table.local_holds(office.other()) {
            if office == Office::Master {
                // Promotion: the vicemaster vacates its own office to take
                // the mastership.
                table.local_mut().flags.remove(Office::ViceMaster.flag());
            } else {
                // The master never steps down to vicemaster.
                return Vec::new();
            }
        }
        if !table.local().flags.can_hold_office() {
            // Disqualified or frozen while the bid circulated.
            return Vec::new();
        }
        if let Some(holder) = table.office_holder(office) {
            if holder.id < self.local_id {
                // Someone lower already won while our token circulated.
                return Vec::new();
            }
            let superseded = holder.id;
            if let Some(member) = table.get_by_id_mut(superseded) {
                member.flags.remove(office.flag());
            }
        }
        table.local_mut().flags.insert(office.flag());
        debug!(%office, "elected");
        vec![
            Action::Publish(ChangeKind::elected(office), self.local_id),
            Action::Send(Frame::election_notification(
                self.local_id,
                office,
                self.local_id,
            )),
        ]
    }

    /// Apply `claimant` as the holder of `office`; lower id wins, the
    /// current holder (possibly us) yields.
    fn apply_claim(
        &mut self,
        table: &mut ClusterNodeTable,
        office: Office,
        claimant: NodeId,
    ) -> Vec<Action> {
        let Some(member) = table.get_by_id(claimant) else {
            warn!(node = claimant, %office, "office claim from unknown node");
            return Vec::new();
        };
        let already = member.holds(office);
        let yielded = table.local_holds(office) && claimant < self.local_id;

        let mut actions = Vec::new();
        if !already {
            if let Some(holder) = table.office_holder(office) {
                let superseded = holder.id;
                if let Some(m) = table.get_by_id_mut(superseded) {
                    m.flags.remove(office.flag());
                }
            }
            if let Some(winner) = table.get_by_id_mut(claimant) {
                // An officeholder is alive by definition and holds exactly
                // one office; a promoted vicemaster sheds its old role here.
                winner.flags.remove(MemberFlags::OUT_OF_CLUSTER);
                winner.flags.remove(office.other().flag());
                winner.flags.insert(office.flag());
            }
            // A voluntary-release freeze ends once the office has moved on.
            table.local_mut().flags.remove(MemberFlags::FROZEN);
            actions.push(Action::Publish(ChangeKind::elected(office), claimant));
            if yielded {
                debug!(winner = claimant, %office, "yielding office to lower node id");
                // Re-notify so every table converges on the lower id.
                actions.push(Action::Send(Frame::election_notification(
                    self.local_id,
                    office,
                    claimant,
                )));
            }
        }
        self.bid_in_flight[office.index()] = None;
        actions.extend(self.maybe_bid(table));
        actions
    }

    /// Start a bid when an office is vacant and we are allowed to run.
    fn maybe_bid(&mut self, table: &ClusterNodeTable) -> Vec<Action> {
        if !table.local().flags.can_hold_office() {
            return Vec::new();
        }
        let office = if table.master().is_none() {
            Office::Master
        } else if table.vicemaster().is_none() {
            Office::ViceMaster
        } else {
            return Vec::new();
        };
        // Holders stay put, with one exception: the vicemaster runs for a
        // vacant mastership. That promotion is the reason the office exists.
        if table.local_holds_any_office()
            && !(office == Office::Master && table.local_holds(Office::ViceMaster))
        {
            return Vec::new();
        }
        if self.bid_in_flight[office.index()].is_some() {
            return Vec::new();
        }
        self.bid_in_flight[office.index()] = Some(Instant::now());
        debug!(%office, "starting election bid");
        vec![Action::Send(Frame::election_bid(
            self.local_id,
            office,
            self.local_id,
        ))]
    }

    /// Whether we outrank `bidder` for `office`. "Better" means a strictly
    /// lower node id, eligible, not disqualified, not frozen and not blocked
    /// by a role we already hold.
    fn is_better_candidate(
        &self,
        table: &ClusterNodeTable,
        office: Office,
        bidder: NodeId,
    ) -> bool {
        if !table.local().flags.can_hold_office() {
            return false;
        }
        if self.local_id >= bidder {
            return false;
        }
        match office {
            Office::Master => {
                if table.local_holds(Office::ViceMaster) {
                    // The sole vicemaster must never drop a master bid: the
                    // cluster would be left without any future leader if it
                    // then failed. With a second vicemaster in sight the
                    // normal tie-break applies.
                    return table.members().iter().any(|m| {
                        m.id != self.local_id
                            && m.holds(Office::ViceMaster)
                            && m.flags.in_cluster()
                    });
                }
                true
            }
            Office::ViceMaster => !table.local_holds(Office::Master),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmm_api::Member;

    fn member(id: NodeId, eligible: bool) -> Member {
        let mut m = Member::new(id, format!("node-{id}"), "127.0.0.1:9500".parse().unwrap());
        if eligible {
            m.flags.insert(MemberFlags::ELIGIBLE);
        }
        m
    }

    /// Three eligible nodes, all in cluster, `local` first.
    fn three_node_table(local: NodeId) -> ClusterNodeTable {
        ClusterNodeTable::from_members(local, vec![member(1, true), member(2, true), member(3, true)])
    }

    fn sends(actions: &[Action]) -> Vec<&Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn set_office(table: &mut ClusterNodeTable, node: NodeId, office: Office) {
        table
            .get_by_id_mut(node)
            .unwrap()
            .flags
            .insert(office.flag());
    }

    #[test]
    fn test_startup_bids_for_master() {
        let mut engine = ElectionEngine::new(1);
        let table = three_node_table(1);
        let actions = engine.startup(&table);
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::Master,
                request: true,
                elected: 1
            }
        );
        assert_eq!(frames[0].dest, Dest::NextOnly);
        // One bid at a time.
        assert!(engine.startup(&table).is_empty());
    }

    #[test]
    fn test_own_bid_returning_declares_election() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        engine.startup(&table);

        let actions = engine.handle_election(&mut table, Office::Master, true, 1);
        assert!(table.local_holds(Office::Master));
        assert!(actions.contains(&Action::Publish(ChangeKind::MasterElected, 1)));
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dest, Dest::Broadcast);
    }

    #[test]
    fn test_lower_id_drops_higher_bid_and_bids_itself() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);

        // Node 2's master bid arrives; we are the strictly better candidate.
        let actions = engine.handle_election(&mut table, Office::Master, true, 2);
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        // The dropped token is replaced by our own bid, never a forward of 2's.
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::Master,
                request: true,
                elected: 1
            }
        );
    }

    #[test]
    fn test_higher_id_forwards_lower_bid() {
        let mut engine = ElectionEngine::new(3);
        let mut table = three_node_table(3);

        let actions = engine.handle_election(&mut table, Office::Master, true, 1);
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dest, Dest::NextOnly);
        assert_eq!(frames[0].sender, 3);
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::Master,
                request: true,
                elected: 1
            }
        );
    }

    #[test]
    fn test_concurrent_bids_lower_id_wins() {
        // Nodes 1 and 2 bid concurrently. 1 drops 2's token; 2 forwards 1's.
        let mut engine1 = ElectionEngine::new(1);
        let mut table1 = three_node_table(1);
        let mut engine2 = ElectionEngine::new(2);
        let mut table2 = three_node_table(2);

        engine1.startup(&table1);
        engine2.startup(&table2);

        assert!(sends(&engine1.handle_election(&mut table1, Office::Master, true, 2)).is_empty());
        let fwd = engine2.handle_election(&mut table2, Office::Master, true, 1);
        assert_eq!(sends(&fwd).len(), 1);

        // 1's token returns; 1 is elected and 2 applies the notification.
        engine1.handle_election(&mut table1, Office::Master, true, 1);
        assert!(table1.local_holds(Office::Master));
        engine2.handle_election(&mut table2, Office::Master, false, 1);
        assert_eq!(table2.master().unwrap().id, 1);
        assert!(!table2.local_holds(Office::Master));
    }

    #[test]
    fn test_notification_triggers_vice_bid() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);

        let actions = engine.handle_election(&mut table, Office::Master, false, 1);
        assert_eq!(table.master().unwrap().id, 1);
        // The master office is taken; we re-check and bid for vicemaster.
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::ViceMaster,
                request: true,
                elected: 2
            }
        );
    }

    #[test]
    fn test_officeholder_yields_to_lower_id_notification() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        set_office(&mut table, 2, Office::Master);

        let actions = engine.handle_election(&mut table, Office::Master, false, 1);
        assert!(!table.local_holds(Office::Master));
        assert_eq!(table.master().unwrap().id, 1);
        // Releases and re-notifies the winner.
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: false,
                elected: 1
            }));
    }

    #[test]
    fn test_officeholder_reasserts_against_higher_id_notification() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        set_office(&mut table, 1, Office::Master);

        let actions = engine.handle_election(&mut table, Office::Master, false, 3);
        assert!(table.local_holds(Office::Master));
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::Master,
                request: false,
                elected: 1
            }
        );
    }

    #[test]
    fn test_duplicate_node_left_is_idempotent() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        set_office(&mut table, 1, Office::Master);
        set_office(&mut table, 2, Office::ViceMaster);

        let first = engine.handle_node_change(&mut table, true, 1);
        assert!(!first.is_empty());
        assert!(table.master().is_none());

        // Re-processing the same leave causes no second demotion or bid.
        let second = engine.handle_node_change(&mut table, true, 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_master_leave_triggers_new_master_bid() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        set_office(&mut table, 1, Office::Master);

        let actions = engine.handle_node_change(&mut table, true, 1);
        assert!(actions.contains(&Action::Publish(ChangeKind::NodeLeft, 1)));
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: true,
                elected: 2
            }));
    }

    #[test]
    fn test_bid_from_disqualified_node_substitutes_qualif_change() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        table
            .get_by_id_mut(3)
            .unwrap()
            .flags
            .insert(MemberFlags::DISQUALIFIED);

        let actions = engine.handle_election(&mut table, Office::Master, true, 3);
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dest, Dest::Node(3));
        assert_eq!(
            frames[0].payload,
            Payload::QualifChange {
                node: 3,
                state: QualifState::Disqualified,
                request: true,
                result: QUALIF_OK,
            }
        );
    }

    #[test]
    fn test_sole_vicemaster_never_drops_master_bid() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        // We hold vicemaster and nobody holds master.
        set_office(&mut table, 1, Office::ViceMaster);

        // Node 3's master bid must be forwarded even though 1 < 3.
        let actions = engine.handle_election(&mut table, Office::Master, true, 3);
        let frames = sends(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload,
            Payload::Election {
                office: Office::Master,
                request: true,
                elected: 3
            }
        );
    }

    #[test]
    fn test_vicemaster_drops_master_bid_when_second_vice_exists() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        set_office(&mut table, 1, Office::ViceMaster);
        // Transient second vicemaster elsewhere.
        set_office(&mut table, 2, Office::ViceMaster);

        let actions = engine.handle_election(&mut table, Office::Master, true, 3);
        assert!(sends(&actions).is_empty());
    }

    #[test]
    fn test_disqualifying_the_master_releases_and_retriggers() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        set_office(&mut table, 1, Office::Master);

        let actions = engine
            .local_set_qualif(&mut table, 1, QualifState::Disqualified)
            .unwrap();

        assert!(!table.local_holds(Office::Master));
        assert!(table.local().flags.contains(MemberFlags::DISQUALIFIED));
        let frames = sends(&actions);
        // The disqualification floods and the release is announced so the
        // remaining qualified nodes start a new election.
        assert!(frames.iter().any(|f| matches!(
            f.payload,
            Payload::Notification {
                kind: ChangeKind::Disqualified,
                node: 1
            }
        )));
        assert!(frames
            .iter()
            .any(|f| matches!(f.payload, Payload::MastershipRelease { .. })));
    }

    #[test]
    fn test_requalification_while_office_vacant_starts_bid() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        table
            .local_mut()
            .flags
            .insert(MemberFlags::DISQUALIFIED);

        // Disqualified nodes never bid.
        assert!(engine.startup(&table).is_empty());

        let actions = engine
            .local_set_qualif(&mut table, 2, QualifState::Qualified)
            .unwrap();
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: true,
                elected: 2
            }));
    }

    #[test]
    fn test_remote_disqualification_demotes_holder() {
        let mut engine = ElectionEngine::new(3);
        let mut table = three_node_table(3);
        set_office(&mut table, 1, Office::Master);

        let actions =
            engine.handle_qualif_change(&mut table, 2, 1, QualifState::Disqualified, false);
        assert!(table.master().is_none());
        assert!(actions.contains(&Action::Publish(ChangeKind::Disqualified, 1)));
        // The vacancy triggers our own bid.
        assert!(!sends(&actions).is_empty());
    }

    #[test]
    fn test_release_requires_holding_mastership() {
        let mut engine = ElectionEngine::new(1);
        let mut table = three_node_table(1);
        assert!(engine.local_release(&mut table).is_err());

        set_office(&mut table, 1, Office::Master);
        let actions = engine.local_release(&mut table).unwrap();
        assert!(!table.local_holds(Office::Master));
        assert!(table.local().flags.contains(MemberFlags::FROZEN));
        let frames = sends(&actions);
        assert!(frames
            .iter()
            .any(|f| matches!(f.payload, Payload::MastershipRelease { .. })));
        // Frozen nodes do not bid for the vacancy they created.
        assert!(engine.startup(&table).is_empty());
    }

    #[test]
    fn test_release_announcement_triggers_election() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        set_office(&mut table, 1, Office::Master);

        let actions = engine.handle_release_announcement(&mut table, 1);
        assert!(table.master().is_none());
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: true,
                elected: 2
            }));
    }

    #[test]
    fn test_vicemaster_promotes_when_master_leaves() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);
        set_office(&mut table, 1, Office::Master);
        set_office(&mut table, 2, Office::ViceMaster);

        // The master is gone; the vicemaster bids for the mastership even
        // though it already holds an office.
        let actions = engine.handle_node_change(&mut table, true, 1);
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: true,
                elected: 2
            }));

        // The returning bid completes the promotion: master gained, vice
        // shed in the same step.
        engine.handle_election(&mut table, Office::Master, true, 2);
        assert!(table.local_holds(Office::Master));
        assert!(!table.local_holds(Office::ViceMaster));
    }

    #[test]
    fn test_promotion_claim_sheds_old_office_everywhere() {
        let mut engine = ElectionEngine::new(3);
        let mut table = three_node_table(3);
        set_office(&mut table, 2, Office::ViceMaster);

        // Node 2 announces it won the mastership; its vicemaster flag must
        // not linger in our table.
        engine.handle_election(&mut table, Office::Master, false, 2);
        let two = table.get_by_id(2).unwrap();
        assert!(two.holds(Office::Master));
        assert!(!two.holds(Office::ViceMaster));
    }

    #[test]
    fn test_tick_restarts_a_lost_bid() {
        let mut engine = ElectionEngine::new(1);
        let table = three_node_table(1);

        assert_eq!(sends(&engine.startup(&table)).len(), 1);
        // The token is still presumed in flight.
        assert!(engine.tick(&table, Duration::from_secs(60)).is_empty());
        // Past the retry bound with the office still vacant, the bid goes
        // out again.
        let retried = engine.tick(&table, Duration::ZERO);
        assert_eq!(sends(&retried).len(), 1);
    }

    #[test]
    fn test_state_push_converges_joiner_table() {
        let mut engine = ElectionEngine::new(2);
        let mut table = three_node_table(2);

        // Node 1 pushes its own record claiming mastership.
        let mut info = member(1, true);
        info.flags.insert(MemberFlags::MASTER);
        info.incarnation = 3;

        let actions = engine.handle_member_info(&mut table, vec![info]);
        let one = table.get_by_id(1).unwrap();
        assert!(one.flags.in_cluster());
        assert_eq!(one.incarnation, 3);
        assert_eq!(table.master().unwrap().id, 1);
        // Master taken; the push triggers our vicemaster bid.
        let frames = sends(&actions);
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::ViceMaster,
                request: true,
                elected: 2
            }));
    }
}

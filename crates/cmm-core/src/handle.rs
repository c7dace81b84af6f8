//! The local API surface: everything a co-located client may ask of the
//! daemon.
//!
//! Queries read a table snapshot directly; mutations travel to the Stack as
//! commands and block on the reply. The handle is cheap to clone and every
//! clone talks to the same node.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use cmm_api::{Member, NodeId, Office, QualifState};
use cmm_common::{CmmError, Result};

use crate::cluster::SharedTable;
use crate::event::{EventFilter, EventPublisher, MembershipEvent, MembershipListener};
use crate::stack::Command;

#[derive(Clone)]
pub struct CmmHandle {
    local_id: NodeId,
    table: SharedTable,
    commands: mpsc::UnboundedSender<Command>,
    publisher: EventPublisher,
}

impl CmmHandle {
    pub(crate) fn new(
        table: SharedTable,
        commands: mpsc::UnboundedSender<Command>,
        publisher: EventPublisher,
    ) -> Self {
        let local_id = table.read().local_id();
        Self {
            local_id,
            table,
            commands,
            publisher,
        }
    }

    /// Identity of the local node.
    pub fn node_getid(&self) -> NodeId {
        self.local_id
    }

    /// Snapshot of one member record.
    pub fn member_getinfo(&self, node: NodeId) -> Result<Member> {
        self.table
            .read()
            .get_by_id(node)
            .cloned()
            .ok_or(CmmError::UnknownNode(node))
    }

    /// Number of nodes currently in the cluster.
    pub fn member_getcount(&self) -> usize {
        self.table
            .read()
            .members()
            .iter()
            .filter(|m| m.flags.in_cluster())
            .count()
    }

    /// Snapshot of every candidate record, in ring order.
    pub fn member_getall(&self) -> Vec<Member> {
        self.table.read().members().to_vec()
    }

    /// The current master, if any.
    pub fn master_getinfo(&self) -> Option<Member> {
        self.table.read().master().cloned()
    }

    /// The current vicemaster, if any.
    pub fn vicemaster_getinfo(&self) -> Option<Member> {
        self.table.read().vicemaster().cloned()
    }

    /// Whether the local node currently holds `office`.
    pub fn holds_office(&self, office: Office) -> bool {
        self.table.read().local_holds(office)
    }

    /// Give up mastership. Fails when the local node is not the master.
    pub async fn mastership_release(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ReleaseMastership { reply })?;
        response
            .await
            .map_err(|_| CmmError::IllegalState("node stopped".to_string()))?
    }

    /// Change a node's qualification. Targeting a remote node sends the
    /// request around the ring; the outcome arrives as an event.
    pub async fn member_setqualif(&self, node: NodeId, state: QualifState) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::SetQualification { node, state, reply })?;
        response
            .await
            .map_err(|_| CmmError::IllegalState("node stopped".to_string()))?
    }

    /// Subscribe to membership events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            rx: self.publisher.subscribe(),
            filter,
        }
    }

    /// Register a callback-style listener; it sees every event.
    pub async fn register_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.publisher.register_listener(listener).await;
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CmmError::IllegalState("node stopped".to_string()))
    }
}

/// A filtered stream of membership events.
pub struct EventSubscription {
    rx: broadcast::Receiver<MembershipEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Next matching event. Events published while the subscriber lags are
    /// skipped, not errored: membership state is carried by the table, the
    /// stream only signals change.
    pub async fn recv(&mut self) -> Result<MembershipEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(event.kind) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CmmError::IllegalState("node stopped".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    use cmm_api::{ChangeKind, MemberFlags};

    use crate::cluster::ClusterNodeTable;

    fn handle_with_publisher() -> (CmmHandle, EventPublisher) {
        let mut one = Member::new(1, "one".to_string(), "127.0.0.1:9501".parse().unwrap());
        one.flags.insert(MemberFlags::MASTER);
        let mut two = Member::new(2, "two".to_string(), "127.0.0.1:9502".parse().unwrap());
        two.flags.insert(MemberFlags::OUT_OF_CLUSTER);
        let table: SharedTable = Arc::new(RwLock::new(ClusterNodeTable::from_members(
            1,
            vec![one, two],
        )));
        let (commands, _rx) = mpsc::unbounded_channel();
        let publisher = EventPublisher::new(16);
        (
            CmmHandle::new(table, commands, publisher.clone()),
            publisher,
        )
    }

    #[test]
    fn test_queries_read_table_snapshot() {
        let (handle, _publisher) = handle_with_publisher();
        assert_eq!(handle.node_getid(), 1);
        assert_eq!(handle.member_getcount(), 1);
        assert_eq!(handle.member_getall().len(), 2);
        assert_eq!(handle.master_getinfo().unwrap().id, 1);
        assert!(handle.vicemaster_getinfo().is_none());
        assert!(handle.holds_office(Office::Master));
        assert_eq!(handle.member_getinfo(2).unwrap().name, "two");
        assert!(handle.member_getinfo(9).is_err());
    }

    #[tokio::test]
    async fn test_subscription_filters_kinds() {
        let (handle, publisher) = handle_with_publisher();
        let mut sub = handle.subscribe(EventFilter::none().with(ChangeKind::NodeLeft));

        publisher
            .publish(MembershipEvent::new(ChangeKind::NodeJoined, 2))
            .await;
        publisher
            .publish(MembershipEvent::new(ChangeKind::NodeLeft, 2))
            .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::NodeLeft);
    }
}

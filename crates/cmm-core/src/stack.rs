//! The Stack: single-threaded protocol dispatcher.
//!
//! Every frame the Lobby routes inward and every local API command funnels
//! into this task, which is the only writer of the cluster node table. It
//! digests each input through the election engine, enqueues the resulting
//! frames on the locally-originated outbound queue and publishes membership
//! events.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use cmm_api::{Frame, NodeId, Payload, QualifState};
use cmm_common::Result;

use crate::cluster::{Action, ElectionEngine, SharedTable};
use crate::config::RingTimings;
use crate::event::{EventPublisher, MembershipEvent};
use crate::sync::FrameQueue;

/// A local API request served by the Stack.
pub enum Command {
    ReleaseMastership {
        reply: oneshot::Sender<Result<()>>,
    },
    SetQualification {
        node: NodeId,
        state: QualifState,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub struct Stack {
    local_id: NodeId,
    table: SharedTable,
    engine: ElectionEngine,
    timings: RingTimings,
    inbound: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::UnboundedReceiver<Command>,
    local_origin: Arc<FrameQueue>,
    publisher: EventPublisher,
}

impl Stack {
    pub fn new(
        table: SharedTable,
        timings: RingTimings,
        inbound: mpsc::UnboundedReceiver<Frame>,
        commands: mpsc::UnboundedReceiver<Command>,
        local_origin: Arc<FrameQueue>,
        publisher: EventPublisher,
    ) -> Self {
        let local_id = table.read().local_id();
        Self {
            local_id,
            table,
            engine: ElectionEngine::new(local_id),
            timings,
            inbound,
            commands,
            local_origin,
            publisher,
        }
    }

    pub async fn run(mut self) {
        // A lone first node receives nothing; it has to notice the vacant
        // offices on its own.
        let startup = {
            let table = self.table.read();
            self.engine.startup(&table)
        };
        self.apply(startup).await;
        info!(node = self.local_id, "stack running");

        let rebid_after = self.timings.heartbeat_timeout;
        let mut retry = tokio::time::interval(rebid_after);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.inbound.recv() => {
                    let Some(frame) = frame else { break };
                    self.dispatch(frame).await;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.serve(command).await;
                }
                _ = retry.tick() => {
                    let actions = {
                        let table = self.table.read();
                        self.engine.tick(&table, rebid_after)
                    };
                    self.apply(actions).await;
                }
            }
        }
        info!(node = self.local_id, "stack stopped");
    }

    async fn dispatch(&mut self, frame: Frame) {
        debug!(%frame, "stack dispatching");
        let sender = frame.sender;
        let actions = {
            let mut table = self.table.write();
            match frame.payload {
                Payload::NodeChange { left, node } => {
                    self.engine.handle_node_change(&mut table, left, node)
                }
                Payload::Election {
                    office,
                    request,
                    elected,
                } => self.engine.handle_election(&mut table, office, request, elected),
                Payload::Notification { kind, node } => {
                    self.engine.handle_notification(&mut table, kind, node)
                }
                Payload::GetMemberInfo { members, .. } => {
                    self.engine.handle_member_info(&mut table, members)
                }
                Payload::MastershipRelease { .. } => {
                    self.engine.handle_release_announcement(&mut table, sender)
                }
                Payload::QualifChange {
                    node,
                    state,
                    request,
                    ..
                } => self
                    .engine
                    .handle_qualif_change(&mut table, sender, node, state, request),
                // Handshake and keepalive frames are consumed by the
                // transport; one reaching the stack is a routing bug.
                Payload::Register { .. } | Payload::Disconnect | Payload::Heartbeat => {
                    warn!(%frame, "transport-level frame reached the stack");
                    Vec::new()
                }
            }
        };
        self.apply(actions).await;
    }

    async fn serve(&mut self, command: Command) {
        match command {
            Command::ReleaseMastership { reply } => {
                let outcome = {
                    let mut table = self.table.write();
                    self.engine.local_release(&mut table)
                };
                match outcome {
                    Ok(actions) => {
                        self.apply(actions).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SetQualification { node, state, reply } => {
                let outcome = {
                    let mut table = self.table.write();
                    self.engine.local_set_qualif(&mut table, node, state)
                };
                match outcome {
                    Ok(actions) => {
                        self.apply(actions).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(frame) => {
                    debug!(%frame, "stack enqueueing");
                    self.local_origin.add(frame);
                }
                Action::Publish(kind, node) => {
                    self.publisher
                        .publish(MembershipEvent::new(kind, node))
                        .await;
                }
            }
        }
    }
}

/// Handle used by the transport and the local API to feed the Stack.
#[derive(Clone)]
pub struct StackSender {
    inbound: mpsc::UnboundedSender<Frame>,
}

impl StackSender {
    pub fn new(inbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self { inbound }
    }

    /// Hand a frame to the Stack. Failure means the Stack is gone, which
    /// only happens during shutdown.
    pub fn deliver(&self, frame: Frame) {
        if self.inbound.send(frame).is_err() {
            error!("stack channel closed, frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmm_api::{ChangeKind, Dest, Member, MemberFlags, Office};
    use parking_lot::RwLock;

    use crate::cluster::ClusterNodeTable;

    fn eligible(id: NodeId) -> Member {
        let mut m = Member::new(id, format!("node-{id}"), "127.0.0.1:9500".parse().unwrap());
        m.flags.insert(MemberFlags::ELIGIBLE);
        if id != 1 {
            m.flags.insert(MemberFlags::OUT_OF_CLUSTER);
        }
        m
    }

    struct Rig {
        table: SharedTable,
        inbound_tx: mpsc::UnboundedSender<Frame>,
        command_tx: mpsc::UnboundedSender<Command>,
        local_origin: Arc<FrameQueue>,
        events: tokio::sync::broadcast::Receiver<MembershipEvent>,
    }

    fn spawn_stack() -> Rig {
        let table: SharedTable = Arc::new(RwLock::new(ClusterNodeTable::from_members(
            1,
            vec![eligible(1), eligible(2), eligible(3)],
        )));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let local_origin = FrameQueue::new();
        let publisher = EventPublisher::new(32);
        let events = publisher.subscribe();
        let stack = Stack::new(
            table.clone(),
            RingTimings::default(),
            inbound_rx,
            command_rx,
            local_origin.clone(),
            publisher,
        );
        tokio::spawn(stack.run());
        Rig {
            table,
            inbound_tx,
            command_tx,
            local_origin,
            events,
        }
    }

    async fn drain_outbound(queue: &FrameQueue) -> Vec<Frame> {
        queue.block().await;
        let mut frames = Vec::new();
        while let Some(frame) = queue.extract_first() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_startup_bid_reaches_outbound_queue() {
        let rig = spawn_stack();
        let frames = drain_outbound(&rig.local_origin).await;
        assert!(frames.iter().any(|f| f.payload
            == Payload::Election {
                office: Office::Master,
                request: true,
                elected: 1
            }));
    }

    #[tokio::test]
    async fn test_returned_bid_elects_and_publishes() {
        let mut rig = spawn_stack();
        drain_outbound(&rig.local_origin).await;

        // Our bid comes back around the ring.
        rig.inbound_tx
            .send(Frame::election_bid(3, Office::Master, 1))
            .unwrap();

        let frames = drain_outbound(&rig.local_origin).await;
        assert!(frames
            .iter()
            .any(|f| f.dest == Dest::Broadcast
                && f.payload
                    == Payload::Election {
                        office: Office::Master,
                        request: false,
                        elected: 1
                    }));
        assert!(rig.table.read().local_holds(Office::Master));

        let event = rig.events.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::MasterElected);
        assert_eq!(event.node, 1);
    }

    #[tokio::test]
    async fn test_release_command_round_trip() {
        let rig = spawn_stack();
        drain_outbound(&rig.local_origin).await;
        rig.inbound_tx
            .send(Frame::election_bid(3, Office::Master, 1))
            .unwrap();
        drain_outbound(&rig.local_origin).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        rig.command_tx
            .send(Command::ReleaseMastership { reply: reply_tx })
            .unwrap();
        reply_rx.await.unwrap().unwrap();
        assert!(!rig.table.read().local_holds(Office::Master));

        // Releasing again fails: we no longer hold the office.
        let (reply_tx, reply_rx) = oneshot::channel();
        rig.command_tx
            .send(Command::ReleaseMastership { reply: reply_tx })
            .unwrap();
        assert!(reply_rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_node_join_publishes_event() {
        let mut rig = spawn_stack();
        drain_outbound(&rig.local_origin).await;

        rig.inbound_tx.send(Frame::node_change(2, false, 2)).unwrap();

        loop {
            let event = rig.events.recv().await.unwrap();
            if event.kind == ChangeKind::NodeJoined {
                assert_eq!(event.node, 2);
                break;
            }
        }
        assert!(rig.table.read().get_by_id(2).unwrap().flags.in_cluster());
    }
}

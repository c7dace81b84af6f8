//! Server half of the ring: accepts the predecessor and routes its frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cmm_api::{Dest, Frame, NodeId, Payload, RegisterAnswer, codec};
use cmm_common::{CmmError, Result};

use crate::cluster::SharedTable;
use crate::config::RingTimings;
use crate::stack::StackSender;
use crate::sync::FrameQueue;

use super::spawn_reader;

/// One registered predecessor connection.
struct PredecessorSession {
    node: NodeId,
    writer: OwnedWriteHalf,
    frames: mpsc::UnboundedReceiver<Frame>,
    reader: JoinHandle<()>,
}

impl PredecessorSession {
    fn close(mut self) {
        self.reader.abort();
        self.frames.close();
    }
}

pub struct Lobby {
    local_id: NodeId,
    listener: TcpListener,
    table: SharedTable,
    timings: RingTimings,
    stack: StackSender,
    /// Ring traffic to pass on to the successor.
    ring_forward: Arc<FrameQueue>,
    /// Frames this node originates; used for the leave announcement when the
    /// predecessor says goodbye.
    local_origin: Arc<FrameQueue>,
}

impl Lobby {
    pub fn new(
        listener: TcpListener,
        table: SharedTable,
        timings: RingTimings,
        stack: StackSender,
        ring_forward: Arc<FrameQueue>,
        local_origin: Arc<FrameQueue>,
    ) -> Self {
        let local_id = table.read().local_id();
        Self {
            local_id,
            listener,
            table,
            timings,
            stack,
            ring_forward,
            local_origin,
        }
    }

    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(node = self.local_id, %addr, "lobby listening"),
            Err(_) => info!(node = self.local_id, "lobby listening"),
        }
        let mut session: Option<PredecessorSession> = None;
        let mut heartbeat = tokio::time::interval(self.timings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Some(new) = self.register(stream, peer).await {
                                // Finish the old predecessor's handover before
                                // reading anything from the new one; its frames
                                // wait in the reader channel meanwhile.
                                if let Some(old) = session.take() {
                                    self.displace(old).await;
                                }
                                session = Some(new);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                frame = next_frame(&mut session) => {
                    match frame {
                        Some(frame) => self.handle(&mut session, frame),
                        None => {
                            // Reader finished: the predecessor is gone. Its
                            // own predecessor detects and announces the
                            // failure; we only wait for a replacement.
                            if let Some(old) = session.take() {
                                debug!(node = old.node, "predecessor connection lost");
                                old.close();
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let failed = match session.as_mut() {
                        Some(current) => codec::send_frame(
                            &mut current.writer,
                            &Frame::heartbeat(self.local_id, current.node),
                        )
                        .await
                        .is_err(),
                        None => false,
                    };
                    if failed && let Some(old) = session.take() {
                        debug!(node = old.node, "heartbeat write failed, dropping predecessor");
                        old.close();
                    }
                }
            }
        }
    }

    /// Run the registration handshake on a fresh connection. Returns the
    /// established session, or `None` when the peer was rejected or vanished.
    async fn register(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Option<PredecessorSession> {
        let _ = stream.set_nodelay(true);
        match self.handshake(stream).await {
            Ok(session) => {
                info!(node = session.node, %peer, "predecessor registered");
                Some(session)
            }
            Err(e) => {
                debug!(%peer, error = %e, "registration failed");
                None
            }
        }
    }

    async fn handshake(&self, mut stream: TcpStream) -> Result<PredecessorSession> {
        let request =
            codec::recv_frame(&mut stream, Some(self.timings.connect_timeout)).await?;
        let node = request.sender;
        if request.register_answer()? != RegisterAnswer::REQUEST {
            return Err(CmmError::Protocol(
                "expected a registration request".to_string(),
            ));
        }
        if self.table.read().get_by_id(node).is_none() {
            let refusal = Frame::register(self.local_id, node, RegisterAnswer::REJECTED);
            let _ = codec::send_frame(&mut stream, &refusal).await;
            return Err(CmmError::Protocol(format!(
                "registration from unknown node {node}"
            )));
        }

        let accept = Frame::register(self.local_id, node, RegisterAnswer::ACCEPTED);
        codec::send_frame(&mut stream, &accept).await?;

        let (read_half, writer) = stream.into_split();
        let (tx, frames) = mpsc::unbounded_channel();
        let reader = spawn_reader(read_half, tx);
        Ok(PredecessorSession {
            node,
            writer,
            frames,
            reader,
        })
    }

    /// A new predecessor displaces the old one: say goodbye, keep routing
    /// whatever the old connection still delivers until the displaced peer
    /// closes, then cut it. Nothing the old predecessor already wrote is
    /// lost in the handover; its sender rescans on the goodbye.
    async fn displace(&self, mut old: PredecessorSession) {
        debug!(node = old.node, "predecessor displaced");
        let goodbye = Frame::disconnect(self.local_id, old.node);
        let _ = tokio::time::timeout(
            self.timings.heartbeat_interval,
            codec::send_frame(&mut old.writer, &goodbye),
        )
        .await;
        // The goodbye makes the peer close, which ends the reader and with
        // it this drain; the bound covers a peer that never closes.
        let drain = async {
            while let Some(frame) = old.frames.recv().await {
                match frame.payload {
                    Payload::Disconnect => break,
                    Payload::Heartbeat => {}
                    _ => self.route(frame),
                }
            }
        };
        let _ = tokio::time::timeout(self.timings.heartbeat_timeout, drain).await;
        old.close();
    }

    /// Digest one frame from the predecessor.
    fn handle(&self, session: &mut Option<PredecessorSession>, frame: Frame) {
        match frame.payload {
            Payload::Disconnect => {
                // Voluntary leave. The leaver cannot announce itself: its
                // own broadcast would have nowhere to die. We announce on
                // its behalf.
                if let Some(old) = session.take() {
                    info!(node = old.node, "predecessor left the ring");
                    let leave = Frame::node_change(self.local_id, true, old.node);
                    self.stack.deliver(leave.clone());
                    self.local_origin.add(leave);
                    old.close();
                }
            }
            Payload::Heartbeat => {
                // Keepalives flow lobby-to-sender, not the other way.
                debug!(%frame, "unexpected heartbeat from predecessor");
            }
            _ => self.route(frame),
        }
    }

    /// Route a ring frame inward, onward, or both.
    fn route(&self, frame: Frame) {
        match frame.dest {
            // Hop-scoped: consumed here, never forwarded.
            Dest::NextOnly => self.stack.deliver(frame),
            Dest::Broadcast => {
                if frame.sender == self.local_id {
                    debug!(%frame, "broadcast completed its loop");
                    return;
                }
                self.stack.deliver(frame.clone());
                self.ring_forward.add(frame);
            }
            Dest::Node(id) if id == self.local_id => self.stack.deliver(frame),
            Dest::Node(_) => {
                if frame.sender == self.local_id {
                    // Our own unicast came back around: the target is
                    // unreachable and the frame dies here.
                    debug!(%frame, "unicast looped, target unreachable");
                    return;
                }
                self.ring_forward.add(frame);
            }
        }
    }
}

async fn next_frame(session: &mut Option<PredecessorSession>) -> Option<Frame> {
    match session {
        Some(current) => current.frames.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use tokio::sync::mpsc::unbounded_channel;

    use cmm_api::{Member, MemberFlags, Office};

    use crate::cluster::ClusterNodeTable;

    fn member(id: NodeId) -> Member {
        let mut m = Member::new(id, format!("node-{id}"), "127.0.0.1:9500".parse().unwrap());
        m.flags.insert(MemberFlags::ELIGIBLE);
        m
    }

    struct Rig {
        addr: SocketAddr,
        stack_rx: mpsc::UnboundedReceiver<Frame>,
        ring_forward: Arc<FrameQueue>,
    }

    async fn spawn_lobby(local: NodeId) -> Rig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table: SharedTable = Arc::new(RwLock::new(ClusterNodeTable::from_members(
            local,
            vec![member(1), member(2), member(3)],
        )));
        let (stack_tx, stack_rx) = unbounded_channel();
        let ring_forward = FrameQueue::new();
        let lobby = Lobby::new(
            listener,
            table,
            RingTimings::default(),
            StackSender::new(stack_tx),
            ring_forward.clone(),
            FrameQueue::new(),
        );
        tokio::spawn(lobby.run());
        Rig {
            addr,
            stack_rx,
            ring_forward,
        }
    }

    async fn connect_registered(addr: SocketAddr, node: NodeId) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        codec::send_frame(
            &mut stream,
            &Frame::register(node, 1, RegisterAnswer::REQUEST),
        )
        .await
        .unwrap();
        let answer = codec::recv_frame(&mut stream, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(answer.register_answer().unwrap(), RegisterAnswer::ACCEPTED);
        stream
    }

    #[tokio::test]
    async fn test_registration_accepted_for_known_node() {
        let rig = spawn_lobby(1).await;
        let _stream = connect_registered(rig.addr, 3).await;
    }

    #[tokio::test]
    async fn test_registration_rejected_for_unknown_node() {
        let rig = spawn_lobby(1).await;
        let mut stream = TcpStream::connect(rig.addr).await.unwrap();
        codec::send_frame(
            &mut stream,
            &Frame::register(77, 1, RegisterAnswer::REQUEST),
        )
        .await
        .unwrap();
        let answer = codec::recv_frame(&mut stream, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(answer.register_answer().unwrap(), RegisterAnswer::REJECTED);
    }

    #[tokio::test]
    async fn test_broadcast_goes_inward_and_onward() {
        let mut rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        let frame = Frame::node_change(2, false, 2);
        codec::send_frame(&mut stream, &frame).await.unwrap();

        let inward = rig.stack_rx.recv().await.unwrap();
        assert_eq!(inward, frame);
        rig.ring_forward.block().await;
        assert_eq!(rig.ring_forward.extract_first().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_own_broadcast_dies_here() {
        let mut rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        codec::send_frame(&mut stream, &Frame::node_change(1, false, 1))
            .await
            .unwrap();
        // A frame behind it proves the first one was consumed, not queued.
        let marker = Frame::election_bid(3, Office::Master, 3);
        codec::send_frame(&mut stream, &marker).await.unwrap();

        assert_eq!(rig.stack_rx.recv().await.unwrap(), marker);
        assert!(rig.ring_forward.is_empty());
    }

    #[tokio::test]
    async fn test_next_only_is_not_forwarded() {
        let mut rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        let bid = Frame::election_bid(3, Office::Master, 3);
        codec::send_frame(&mut stream, &bid).await.unwrap();

        assert_eq!(rig.stack_rx.recv().await.unwrap(), bid);
        assert!(rig.ring_forward.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_unicast_is_forwarded_only() {
        let mut rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        let unicast = Frame::new(
            3,
            Dest::Node(2),
            Payload::QualifChange {
                node: 2,
                state: cmm_api::QualifState::Disqualified,
                request: true,
                result: 0,
            },
        );
        codec::send_frame(&mut stream, &unicast).await.unwrap();

        rig.ring_forward.block().await;
        assert_eq!(rig.ring_forward.extract_first().unwrap(), unicast);
        assert!(rig.stack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lobby_heartbeats_its_predecessor() {
        let rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        let frame = codec::recv_frame(&mut stream, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(frame.payload, Payload::Heartbeat);
        assert_eq!(frame.sender, 1);
    }

    #[tokio::test]
    async fn test_displaced_predecessor_frames_survive_handover() {
        let mut rig = spawn_lobby(1).await;
        let mut old = connect_registered(rig.addr, 3).await;

        let first = Frame::node_change(3, false, 3);
        let second = Frame::election_bid(3, Office::Master, 3);
        codec::send_frame(&mut old, &first).await.unwrap();
        codec::send_frame(&mut old, &second).await.unwrap();

        // A new predecessor registers right behind the writes; the frames
        // may still be in flight on the old connection.
        let _new = connect_registered(rig.addr, 2).await;

        assert_eq!(rig.stack_rx.recv().await.unwrap(), first);
        assert_eq!(rig.stack_rx.recv().await.unwrap(), second);

        // The displaced connection is told to go away.
        loop {
            let frame = codec::recv_frame(&mut old, Some(Duration::from_secs(2)))
                .await
                .unwrap();
            if frame.payload == Payload::Disconnect {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_triggers_leave_announcement() {
        let mut rig = spawn_lobby(1).await;
        let mut stream = connect_registered(rig.addr, 3).await;

        codec::send_frame(&mut stream, &Frame::disconnect(3, 1))
            .await
            .unwrap();

        let announced = rig.stack_rx.recv().await.unwrap();
        assert_eq!(
            announced.payload,
            Payload::NodeChange {
                left: true,
                node: 3
            }
        );
        assert_eq!(announced.sender, 1);
    }
}

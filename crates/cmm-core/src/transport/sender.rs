//! Client half of the ring: finds the successor and drains the outbound
//! queues onto that connection.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use cmm_api::{Dest, Frame, NodeId, Payload, RegisterAnswer, codec};
use cmm_common::{CmmError, Result};

use crate::cluster::SharedTable;
use crate::config::RingTimings;
use crate::stack::StackSender;
use crate::sync::{FrameQueue, WaitResult};

use super::spawn_reader;

enum Disposition {
    Rescan,
    Shutdown,
}

pub struct RingSender {
    local_id: NodeId,
    table: SharedTable,
    timings: RingTimings,
    stack: StackSender,
    /// Ring traffic handed over by the Lobby; drained before local traffic.
    ring_forward: Arc<FrameQueue>,
    /// Frames originated by the Stack.
    local_origin: Arc<FrameQueue>,
    shutdown: watch::Receiver<bool>,
}

impl RingSender {
    pub fn new(
        table: SharedTable,
        timings: RingTimings,
        stack: StackSender,
        ring_forward: Arc<FrameQueue>,
        local_origin: Arc<FrameQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let local_id = table.read().local_id();
        Self {
            local_id,
            table,
            timings,
            stack,
            ring_forward,
            local_origin,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(node = self.local_id, "sender running");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some((successor, stream)) = self.find_successor().await else {
                // Nobody reachable, not even ourselves. Back off and rescan.
                tokio::time::sleep(self.timings.heartbeat_interval).await;
                continue;
            };
            // Announce ourselves; the broadcast dies back at our own lobby
            // after informing the whole ring. Receivers that already know us
            // ignore it.
            self.local_origin
                .add(Frame::node_change(self.local_id, false, self.local_id));

            match self.serve(successor, stream).await {
                Disposition::Rescan => continue,
                Disposition::Shutdown => break,
            }
        }
        info!(node = self.local_id, "sender stopped");
    }

    /// Walk the table in ring order and register with the first candidate
    /// that answers. In-cluster candidates skipped on the way are dead:
    /// announce them so the whole ring converges, not just us.
    async fn find_successor(&self) -> Option<(NodeId, TcpStream)> {
        let candidates: Vec<(NodeId, std::net::SocketAddr, bool)> = {
            let table = self.table.read();
            let mut list: Vec<_> = table
                .members()
                .iter()
                .skip(1)
                .map(|m| (m.id, m.addr, m.flags.in_cluster()))
                .collect();
            // Last resort: a cluster of one closes the ring on itself.
            list.push((table.local().id, table.local().addr, true));
            list
        };

        let mut skipped: Vec<NodeId> = Vec::new();
        for (id, addr, in_cluster) in candidates {
            match self.try_register(id, addr).await {
                Ok(stream) => {
                    debug!(successor = id, "registered with successor");
                    for dead in skipped {
                        info!(node = dead, "successor scan found node unreachable");
                        let leave = Frame::node_change(self.local_id, true, dead);
                        self.stack.deliver(leave.clone());
                        self.local_origin.add(leave);
                    }
                    return Some((id, stream));
                }
                Err(e) => {
                    debug!(candidate = id, error = %e, "candidate unreachable");
                    if in_cluster && id != self.local_id {
                        skipped.push(id);
                    }
                }
            }
        }
        None
    }

    async fn try_register(&self, id: NodeId, addr: std::net::SocketAddr) -> Result<TcpStream> {
        let mut stream =
            tokio::time::timeout(self.timings.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| CmmError::Connection(format!("connect to {addr} timed out")))??;
        let _ = stream.set_nodelay(true);

        let request = Frame::register(self.local_id, id, RegisterAnswer::REQUEST);
        codec::send_frame(&mut stream, &request).await?;

        let answer = codec::recv_frame(&mut stream, Some(self.timings.connect_timeout)).await?;
        match answer.register_answer()? {
            RegisterAnswer::ACCEPTED => Ok(stream),
            _ => Err(CmmError::Connection(format!(
                "registration rejected by node {id}"
            ))),
        }
    }

    /// One successor session: drain outbound queues, watch the successor's
    /// heartbeats. Any failure ends in a rescan; the scan itself announces
    /// whoever turns out to be dead.
    async fn serve(&self, successor: NodeId, stream: TcpStream) -> Disposition {
        let (read_half, mut writer) = stream.into_split();
        let (tx, mut heartbeats) = mpsc::unbounded_channel();
        let reader = spawn_reader(read_half, tx);
        let mut shutdown = self.shutdown.clone();
        let mut last_seen = Instant::now();

        let disposition = loop {
            if last_seen.elapsed() > self.timings.heartbeat_timeout {
                warn!(successor, "successor heartbeats stopped");
                break Disposition::Rescan;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    // Say goodbye so the successor announces our departure
                    // instead of waiting out the heartbeat timeout.
                    let goodbye = Frame::disconnect(self.local_id, successor);
                    let _ = codec::send_frame(&mut writer, &goodbye).await;
                    break Disposition::Shutdown;
                }
                frame = heartbeats.recv() => {
                    match frame {
                        Some(frame) if frame.payload == Payload::Heartbeat => {
                            last_seen = Instant::now();
                        }
                        Some(frame) if frame.payload == Payload::Disconnect => {
                            // Displaced by a joiner registering behind us.
                            debug!(successor, "successor said goodbye");
                            break Disposition::Rescan;
                        }
                        Some(frame) => debug!(%frame, "unexpected frame from successor"),
                        None => {
                            // Closed on us: either the successor died or a
                            // joiner displaced this connection. The rescan
                            // sorts out which.
                            debug!(successor, "successor closed the connection");
                            break Disposition::Rescan;
                        }
                    }
                }
                wait = self.ring_forward.timed_block(self.timings.heartbeat_interval) => {
                    if wait == WaitResult::Ready && self.flush(&mut writer).await.is_err() {
                        warn!(successor, "write to successor failed");
                        break Disposition::Rescan;
                    }
                }
            }
        };
        reader.abort();
        disposition
    }

    /// Push everything queued onto the wire, ring traffic before locally
    /// originated traffic.
    async fn flush(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        self.drain(&self.ring_forward, writer).await?;
        self.purge_stale();
        self.drain(&self.local_origin, writer).await
    }

    /// A frame leaves the queue only after the write succeeded, so nothing
    /// is lost across a reconnect.
    async fn drain(&self, queue: &FrameQueue, writer: &mut OwnedWriteHalf) -> Result<()> {
        while let Some(frame) = queue.get_first() {
            codec::send_frame(writer, &frame).await?;
            queue.remove_current();
        }
        Ok(())
    }

    /// Drop queued unicasts whose target has left the cluster; forwarding
    /// them would only cycle the ring once before dying back here.
    fn purge_stale(&self) {
        let table = self.table.read();
        let mut current = self.local_origin.get_first();
        while let Some(frame) = current {
            if let Dest::Node(id) = frame.dest
                && table.get_by_id(id).is_none_or(|m| !m.flags.in_cluster())
            {
                debug!(%frame, "dropping unicast to unreachable node");
                self.local_origin.remove_current();
            }
            current = self.local_origin.get_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use parking_lot::RwLock;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;

    use cmm_api::{Member, MemberFlags};

    use crate::cluster::ClusterNodeTable;

    fn timings() -> RingTimings {
        RingTimings {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(400),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn member(id: NodeId, addr: SocketAddr, in_cluster: bool) -> Member {
        let mut m = Member::new(id, format!("node-{id}"), addr);
        m.flags.insert(MemberFlags::ELIGIBLE);
        if !in_cluster {
            m.flags.insert(MemberFlags::OUT_OF_CLUSTER);
        }
        m
    }

    /// Accepts one registration and streams received frames into a channel.
    async fn fake_successor(
        id: NodeId,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<Frame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = codec::recv_frame(&mut stream, Some(Duration::from_secs(2)))
                .await
                .unwrap();
            let accept =
                Frame::register(id, request.sender, RegisterAnswer::ACCEPTED);
            codec::send_frame(&mut stream, &accept).await.unwrap();
            loop {
                match codec::recv_frame(&mut stream, None).await {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        (addr, rx)
    }

    /// An address nothing listens on: bind, note the port, drop the socket.
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn spawn_sender(
        members: Vec<Member>,
    ) -> (
        mpsc::UnboundedReceiver<Frame>,
        Arc<FrameQueue>,
        watch::Sender<bool>,
    ) {
        let table: SharedTable =
            Arc::new(RwLock::new(ClusterNodeTable::from_members(1, members)));
        let (stack_tx, stack_rx) = unbounded_channel();
        let ring_forward = FrameQueue::new();
        let local_origin = FrameQueue::new();
        local_origin.couple_with(&ring_forward);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender = RingSender::new(
            table,
            timings(),
            StackSender::new(stack_tx),
            ring_forward,
            local_origin.clone(),
            shutdown_rx,
        );
        tokio::spawn(sender.run());
        (stack_rx, local_origin, shutdown_tx)
    }

    #[tokio::test]
    async fn test_connects_to_first_candidate_and_announces_join() {
        let (addr2, mut seen) = fake_successor(2).await;
        let local = member(1, dead_addr().await, true);
        let (_stack, _origin, _shutdown) =
            spawn_sender(vec![local, member(2, addr2, true)]);

        let frame = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            frame.payload,
            Payload::NodeChange {
                left: false,
                node: 1
            }
        );
        assert_eq!(frame.dest, Dest::Broadcast);
    }

    #[tokio::test]
    async fn test_skipped_in_cluster_candidate_is_announced_dead() {
        let (addr3, mut seen) = fake_successor(3).await;
        let dead = dead_addr().await;
        let local = member(1, dead_addr().await, true);
        let (mut stack_rx, _origin, _shutdown) = spawn_sender(vec![
            local,
            member(2, dead, true),
            member(3, addr3, true),
        ]);

        // Our own stack learns about the death directly.
        let inward = tokio::time::timeout(Duration::from_secs(2), stack_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            inward.payload,
            Payload::NodeChange {
                left: true,
                node: 2
            }
        );

        // The ring hears the death before our join.
        let first = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first.payload,
            Payload::NodeChange {
                left: true,
                node: 2
            }
        );
        let second = seen.recv().await.unwrap();
        assert_eq!(
            second.payload,
            Payload::NodeChange {
                left: false,
                node: 1
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_cluster_candidates_are_skipped_silently() {
        let (addr3, _seen) = fake_successor(3).await;
        let dead = dead_addr().await;
        let local = member(1, dead_addr().await, true);
        let (mut stack_rx, _origin, _shutdown) = spawn_sender(vec![
            local,
            member(2, dead, false),
            member(3, addr3, true),
        ]);

        // Node 2 was already out; no leave announcement for it.
        let inward =
            tokio::time::timeout(Duration::from_millis(500), stack_rx.recv()).await;
        assert!(inward.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_sends_disconnect() {
        let (addr2, mut seen) = fake_successor(2).await;
        let local = member(1, dead_addr().await, true);
        let (_stack, _origin, shutdown) =
            spawn_sender(vec![local, member(2, addr2, true)]);

        // Wait for the join so the session is up, then shut down.
        seen.recv().await.unwrap();
        shutdown.send(true).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, Payload::Disconnect);
        assert_eq!(frame.sender, 1);
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_successor_ring_traffic_first() {
        let (addr2, mut seen) = fake_successor(2).await;
        let local = member(1, dead_addr().await, true);

        let table: SharedTable = Arc::new(RwLock::new(ClusterNodeTable::from_members(
            1,
            vec![local, member(2, addr2, true)],
        )));
        let (stack_tx, _stack_rx) = unbounded_channel();
        let ring_forward = FrameQueue::new();
        let local_origin = FrameQueue::new();
        local_origin.couple_with(&ring_forward);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Enqueue before the session starts; both must still go out, with
        // forwarded ring traffic ahead of our own.
        let forwarded = Frame::node_change(3, false, 3);
        ring_forward.add(forwarded.clone());

        let sender = RingSender::new(
            table,
            timings(),
            StackSender::new(stack_tx),
            ring_forward,
            local_origin,
            shutdown_rx,
        );
        tokio::spawn(sender.run());

        let first = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, forwarded);
        let second = seen.recv().await.unwrap();
        assert_eq!(
            second.payload,
            Payload::NodeChange {
                left: false,
                node: 1
            }
        );
    }
}

//! Node lifecycle: wire the three workers together, start them, stop them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use cmm_common::{CmmError, Result};

use crate::cluster::{ClusterNodeTable, SharedTable};
use crate::config::NodeConfig;
use crate::event::EventPublisher;
use crate::handle::CmmHandle;
use crate::stack::{Stack, StackSender};
use crate::sync::FrameQueue;
use crate::transport::{Lobby, RingSender};

/// A running CMM daemon instance.
///
/// `start` is all-or-nothing: a bad candidate file or an unbindable ring
/// port fails the whole startup instead of leaving a half-alive node.
pub struct CmmNode {
    handle: CmmHandle,
    shutdown: watch::Sender<bool>,
    lobby_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
    stack_task: JoinHandle<()>,
    /// Grace period for the goodbye frame during shutdown.
    grace: Duration,
}

impl CmmNode {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let table = ClusterNodeTable::load(&config.config_file, config.local_id)?;
        let ring_addr = table.local().addr;
        let listener = TcpListener::bind(ring_addr).await.map_err(|e| {
            CmmError::Resource(format!("cannot bind ring port {ring_addr}: {e}"))
        })?;
        let table: SharedTable = Arc::new(RwLock::new(table));

        let ring_forward = FrameQueue::new();
        let local_origin = FrameQueue::new();
        local_origin.couple_with(&ring_forward);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let publisher = EventPublisher::new(64);
        let stack_sender = StackSender::new(inbound_tx);

        let lobby = Lobby::new(
            listener,
            table.clone(),
            config.timings,
            stack_sender.clone(),
            ring_forward.clone(),
            local_origin.clone(),
        );
        let sender = RingSender::new(
            table.clone(),
            config.timings,
            stack_sender,
            ring_forward,
            local_origin.clone(),
            shutdown_rx,
        );
        let stack = Stack::new(
            table.clone(),
            config.timings,
            inbound_rx,
            command_rx,
            local_origin,
            publisher.clone(),
        );

        let lobby_task = tokio::spawn(lobby.run());
        let sender_task = tokio::spawn(sender.run());
        let stack_task = tokio::spawn(stack.run());

        info!(node = config.local_id, %ring_addr, "cmm node started");
        Ok(Self {
            handle: CmmHandle::new(table, command_tx, publisher),
            shutdown,
            lobby_task,
            sender_task,
            stack_task,
            grace: config.timings.heartbeat_interval,
        })
    }

    /// Handle for local queries, commands and subscriptions.
    pub fn handle(&self) -> CmmHandle {
        self.handle.clone()
    }

    /// Leave the ring and stop every worker. The sender gets a grace period
    /// to deliver its goodbye so the successor announces our departure
    /// immediately instead of waiting out the heartbeat timeout.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let mut sender_task = self.sender_task;
        if tokio::time::timeout(self.grace, &mut sender_task)
            .await
            .is_err()
        {
            sender_task.abort();
        }
        self.lobby_task.abort();
        self.stack_task.abort();
        info!("cmm node stopped");
    }
}

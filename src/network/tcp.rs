//! TCP transport with a sequencer node for multicast order.
//!
//! ```text
//!   node B ──multicast──▶ sequencer A ──┬──▶ A (local)
//!                                       ├──▶ B
//!                                       └──▶ C
//! ```
//!
//! The lowest member is the sequencer. Other nodes forward their multicasts
//! to it, and it fans each one out to every member, itself included. One
//! sender loop writes all frames over per-peer connections, so every peer
//! receives the fan-outs in the order the sequencer produced them.
//!
//! Members must agree on the member set. If two nodes disagree on who the
//! lowest member is during a view change, a multicast can be sequenced twice.

use crate::error::{NetworkError, Result};
use crate::metrics::{Counter, Gauge};
use crate::network::server::EnvelopeHandler;
use crate::network::transport::Transport;
use crate::processor::ProcessorHandle;
use crate::types::NodeAddress;
use crate::wire::{frame_envelope, Envelope};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Configuration for transport behavior
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum attempts for one frame
    pub max_retries: usize,
    /// Delay between retries
    pub retry_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Write timeout
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Commands that can be sent to the sender loop
#[derive(Debug)]
enum SenderCommand {
    /// Drop the cached connection to a peer
    ClearConnection(NodeAddress),
    /// Shutdown the sender loop with acknowledgment
    Shutdown(oneshot::Sender<()>),
}

/// Transport metrics for monitoring
#[derive(Debug)]
pub struct TransportMetrics {
    pub frames_sent: Counter,
    pub frames_failed: Counter,
    pub connections_created: Counter,
    pub connections_failed: Counter,
    pub active_connections: Gauge,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self {
            frames_sent: Counter::new("keygrid_transport_frames_sent_total", "Frames written to peers"),
            frames_failed: Counter::new(
                "keygrid_transport_frames_failed_total",
                "Frames dropped after all retries",
            ),
            connections_created: Counter::new(
                "keygrid_transport_connections_created_total",
                "Peer connections opened",
            ),
            connections_failed: Counter::new(
                "keygrid_transport_connections_failed_total",
                "Peer connections that failed",
            ),
            active_connections: Gauge::new(
                "keygrid_transport_active_connections",
                "Cached peer connections",
            ),
        }
    }
}

/// Transport between processors of different processes.
pub struct TcpTransport {
    /// This node.
    address: NodeAddress,

    /// Cluster members, this node included.
    members: RwLock<BTreeSet<NodeAddress>>,

    /// Processor that receives envelopes addressed to this node.
    local: RwLock<Option<ProcessorHandle>>,

    /// Held while the sequencer fans out one multicast.
    sequence: Mutex<()>,

    /// Channel for outgoing frames.
    outgoing_tx: mpsc::UnboundedSender<(NodeAddress, Bytes)>,

    /// Channel for control commands
    command_tx: mpsc::UnboundedSender<SenderCommand>,

    config: TransportConfig,

    metrics: Arc<TransportMetrics>,
}

impl TcpTransport {
    /// Create a transport with default config.
    pub fn new(address: NodeAddress) -> Arc<Self> {
        Self::with_config(address, TransportConfig::default())
    }

    /// Create a transport and spawn its sender loop.
    pub fn with_config(address: NodeAddress, config: TransportConfig) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(TransportMetrics::default());

        tokio::spawn(Self::sender_loop(
            address,
            outgoing_rx,
            command_rx,
            config.clone(),
            metrics.clone(),
        ));

        info!(node = %address, "TcpTransport created");

        Arc::new(Self {
            address,
            members: RwLock::new(BTreeSet::from([address])),
            local: RwLock::new(None),
            sequence: Mutex::new(()),
            outgoing_tx,
            command_tx,
            config,
            metrics,
        })
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Route envelopes for this node to `handle`.
    pub fn attach(&self, handle: ProcessorHandle) {
        *self.local.write() = Some(handle);
    }

    pub fn add_member(&self, member: NodeAddress) {
        if self.members.write().insert(member) {
            debug!(node = %self.address, member = %member, "Member added");
        }
    }

    pub fn remove_member(&self, member: NodeAddress) {
        if member == self.address {
            return;
        }
        if self.members.write().remove(&member) {
            let _ = self.command_tx.send(SenderCommand::ClearConnection(member));
            debug!(node = %self.address, member = %member, "Member removed");
        }
    }

    /// Members, lowest address first.
    pub fn members(&self) -> Vec<NodeAddress> {
        self.members.read().iter().copied().collect()
    }

    /// Node that orders multicasts.
    pub fn sequencer(&self) -> NodeAddress {
        self.members
            .read()
            .iter()
            .next()
            .copied()
            .unwrap_or(self.address)
    }

    pub fn is_sequencer(&self) -> bool {
        self.sequencer() == self.address
    }

    /// Shutdown the sender loop gracefully
    pub async fn shutdown(&self) {
        info!(node = %self.address, "Shutting down transport");

        let (tx, rx) = oneshot::channel();
        let _ = self.command_tx.send(SenderCommand::Shutdown(tx));

        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(_)) => info!(node = %self.address, "Transport shutdown complete"),
            Ok(Err(_)) => warn!(node = %self.address, "Shutdown channel dropped"),
            Err(_) => warn!(node = %self.address, "Transport shutdown timeout"),
        }
    }

    fn deliver_local(&self, envelope: Envelope) -> Result<()> {
        match self.local.read().as_ref() {
            Some(handle) => handle.deliver(envelope),
            None => Err(NetworkError::SendFailed("no processor attached".to_string()).into()),
        }
    }

    fn enqueue(&self, to: NodeAddress, frame: Bytes) -> Result<()> {
        self.outgoing_tx
            .send((to, frame))
            .map_err(|_| NetworkError::SendFailed("channel closed".to_string()).into())
    }

    /// Fan a multicast out to every member. Only the sequencer calls this.
    fn sequence(&self, envelope: Envelope) -> Result<()> {
        let frame = Bytes::from(frame_envelope(&envelope)?);
        let _order = self.sequence.lock();
        trace!(node = %self.address, request_id = %envelope.id(), "Sequencing multicast");
        for member in self.members() {
            if member == self.address {
                if let Err(e) = self.deliver_local(envelope.clone()) {
                    warn!(node = %self.address, error = %e, "Local delivery failed");
                }
            } else {
                self.enqueue(member, frame.clone())?;
            }
        }
        Ok(())
    }

    /// Background loop that writes queued frames with retry logic.
    async fn sender_loop(
        address: NodeAddress,
        mut rx: mpsc::UnboundedReceiver<(NodeAddress, Bytes)>,
        mut command_rx: mpsc::UnboundedReceiver<SenderCommand>,
        config: TransportConfig,
        metrics: Arc<TransportMetrics>,
    ) {
        info!(node = %address, "Sender loop started");

        let mut connections: HashMap<NodeAddress, TcpStream> = HashMap::new();

        loop {
            tokio::select! {
                Some((to, frame)) = rx.recv() => {
                    let mut attempts = 0;
                    let mut success = false;

                    while attempts < config.max_retries && !success {
                        attempts += 1;

                        match Self::send_with_timeout(&mut connections, to, &frame, &config, &metrics).await {
                            Ok(()) => {
                                metrics.frames_sent.inc();
                                success = true;
                            }
                            Err(e) => {
                                warn!(node = %address, to = %to, error = %e, attempt = attempts, "Failed to send frame");

                                if let Some(mut stream) = connections.remove(&to) {
                                    let _ = stream.shutdown().await;
                                }
                                metrics.active_connections.set(connections.len());
                                metrics.connections_failed.inc();

                                if attempts < config.max_retries {
                                    sleep(config.retry_delay).await;
                                }
                            }
                        }
                    }

                    if !success {
                        error!(node = %address, to = %to, attempts, "Failed to send frame after all retries");
                        metrics.frames_failed.inc();
                    }
                }

                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        SenderCommand::ClearConnection(peer) => {
                            if let Some(mut stream) = connections.remove(&peer) {
                                let _ = stream.shutdown().await;
                                metrics.active_connections.set(connections.len());
                                debug!(node = %address, peer = %peer, "Connection cleared");
                            }
                        }
                        SenderCommand::Shutdown(ack) => {
                            info!(node = %address, "Received shutdown command");
                            let _ = ack.send(());
                            break;
                        }
                    }
                }

                else => break,
            }
        }

        for (peer, mut stream) in connections.drain() {
            let _ = stream.shutdown().await;
            debug!(node = %address, peer = %peer, "Connection closed");
        }

        metrics.active_connections.set(0);
        info!(node = %address, "Sender loop exited");
    }

    async fn send_with_timeout(
        connections: &mut HashMap<NodeAddress, TcpStream>,
        to: NodeAddress,
        frame: &[u8],
        config: &TransportConfig,
        metrics: &TransportMetrics,
    ) -> Result<()> {
        tokio::time::timeout(
            config.write_timeout,
            Self::send_to_peer(connections, to, frame, config, metrics),
        )
        .await
        .map_err(|_| NetworkError::SendFailed("send timeout".to_string()))?
    }

    async fn send_to_peer(
        connections: &mut HashMap<NodeAddress, TcpStream>,
        to: NodeAddress,
        frame: &[u8],
        config: &TransportConfig,
        metrics: &TransportMetrics,
    ) -> Result<()> {
        if !connections.contains_key(&to) {
            let stream = Self::connect(to, config).await?;
            metrics.connections_created.inc();
            connections.insert(to, stream);
            metrics.active_connections.set(connections.len());
        }
        let Some(stream) = connections.get_mut(&to) else {
            return Err(NetworkError::ConnectionClosed.into());
        };

        stream
            .write_all(frame)
            .await
            .map_err(|e| NetworkError::SendFailed(format!("failed to write frame: {}", e)))?;

        stream
            .flush()
            .await
            .map_err(|e| NetworkError::SendFailed(format!("failed to flush: {}", e)))?;

        Ok(())
    }

    async fn connect(to: NodeAddress, config: &TransportConfig) -> Result<TcpStream> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(to.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: to,
                reason: "connection timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: to,
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        match envelope.header.receiver {
            Some(receiver) if receiver == self.address => self.deliver_local(envelope),
            Some(receiver) => self.enqueue(receiver, Bytes::from(frame_envelope(&envelope)?)),
            None if self.is_sequencer() => self.sequence(envelope),
            None => {
                let sequencer = self.sequencer();
                trace!(node = %self.address, sequencer = %sequencer, "Forwarding multicast");
                self.enqueue(sequencer, Bytes::from(frame_envelope(&envelope)?))
            }
        }
    }
}

impl EnvelopeHandler for TcpTransport {
    fn handle(&self, envelope: Envelope) -> Result<()> {
        if envelope.is_multicast() && self.is_sequencer() {
            self.sequence(envelope)
        } else {
            self.deliver_local(envelope)
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.command_tx.send(SenderCommand::Shutdown(tx));
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("members", &self.members())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::lock::LockRequest;
    use crate::network::server::NetworkServer;
    use crate::partitioning::RingBucketAssignment;
    use crate::processor::{ClusterProcessor, LocalRequest, ProcessorRuntime};
    use crate::types::{Binary, SystemClock};
    use crate::wire::{LockResult, ResponsePayload};
    use tokio::net::TcpListener;

    async fn allocate_addr() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    struct TestNode {
        transport: Arc<TcpTransport>,
        handle: ProcessorHandle,
        server_shutdown: mpsc::Sender<()>,
    }

    async fn start_cluster(n: u64) -> Vec<TestNode> {
        let mut addresses = Vec::new();
        for id in 1..=n {
            addresses.push(NodeAddress::new(id, allocate_addr().await));
        }
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, addresses.clone()));

        let mut nodes = Vec::new();
        for address in &addresses {
            let transport = TcpTransport::new(*address);
            for member in &addresses {
                transport.add_member(*member);
            }
            let config = NodeConfig::new(*address).with_bucket_count(16);
            let processor = ClusterProcessor::new(config, assignment.clone(), Arc::new(SystemClock))
                .with_members(addresses.clone());
            let (handle, _task) = ProcessorRuntime::spawn(processor, transport.clone());
            transport.attach(handle.clone());

            let (server, server_shutdown) = NetworkServer::new(address.addr, transport.clone());
            tokio::spawn(server.run());
            nodes.push(TestNode {
                transport,
                handle,
                server_shutdown,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        nodes
    }

    fn lock_of(owner: NodeAddress, thread: u64) -> LockRequest {
        LockRequest::new("r", Binary::from_static(b"k"), owner, thread, "t", false)
    }

    #[tokio::test]
    async fn test_sequencer_is_lowest_member() {
        let a = NodeAddress::local(5);
        let transport = TcpTransport::new(a);
        assert!(transport.is_sequencer());

        transport.add_member(NodeAddress::local(2));
        assert_eq!(transport.sequencer(), NodeAddress::local(2));
        assert!(!transport.is_sequencer());

        transport.remove_member(NodeAddress::local(2));
        transport.remove_member(a);
        assert_eq!(transport.members(), vec![a]);
    }

    #[tokio::test]
    async fn test_send_without_processor_fails() {
        let a = NodeAddress::local(1);
        let transport = TcpTransport::new(a);
        let envelope = Envelope::request(
            a,
            a,
            crate::wire::Payload::EntryCount(crate::lock::EntryCountRequest::new(lock_of(a, 1))),
        );
        assert!(transport.send(envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_multicast_through_sequencer() {
        let nodes = start_cluster(3).await;
        let requester = &nodes[2];
        let owner = requester.handle.address();

        // Node 3 is not the sequencer; its multicast makes a round trip
        // through node 1 before it executes anywhere.
        let response = requester
            .handle
            .execute(LocalRequest::AcquireLock {
                lock: lock_of(owner, 1),
                timeout: None,
                unlock_timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(response.payload, ResponsePayload::Lock(LockResult::Granted));

        let other = nodes[1].handle.address();
        let response = nodes[1]
            .handle
            .execute(LocalRequest::AcquireLock {
                lock: lock_of(other, 1),
                timeout: Some(Duration::ZERO),
                unlock_timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(response.payload, ResponsePayload::Lock(LockResult::WaitExpired));
        assert!(nodes[0].transport.metrics().frames_sent.get() >= 4);

        for node in &nodes {
            node.handle.shutdown().await;
            node.transport.shutdown().await;
            let _ = node.server_shutdown.send(()).await;
        }
    }
}

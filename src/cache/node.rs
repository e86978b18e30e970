//! A running grid node.

use crate::cache::PartitionedCache;
use crate::cluster::{MemberEvent, MemberEventListener, ProcessorEventListener};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::lock::ReadWriteLock;
use crate::metrics::ProcessorMetrics;
use crate::network::{LocalNetwork, NetworkServer, TcpTransport, Transport};
use crate::partitioning::RingBucketAssignment;
use crate::processor::{ClusterProcessor, ProcessorHandle, ProcessorRuntime};
use crate::types::{Binary, NodeAddress, SystemClock};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How the node is connected to its peers.
enum Attachment {
    /// Caller-supplied transport; membership events come from the caller.
    External,
    /// In-process network shared with the other nodes.
    Local(Arc<LocalNetwork>),
    /// TCP transport with its listening server.
    Tcp {
        transport: Arc<TcpTransport>,
        server_shutdown: mpsc::Sender<()>,
    },
}

/// A grid node: one processor task, its transport and the bucket ring it
/// shares with its peers.
///
/// # Example
///
/// ```rust,no_run
/// use keygrid::cache::CacheNode;
/// use keygrid::config::NodeConfig;
/// use keygrid::lock::LockOwnerIdentity;
/// use keygrid::partitioning::RingBucketAssignment;
/// use keygrid::types::NodeAddress;
/// use std::sync::Arc;
///
/// # async fn run() -> keygrid::error::Result<()> {
/// let me = NodeAddress::new(1, "127.0.0.1:7401".parse().unwrap());
/// let peer = NodeAddress::new(2, "127.0.0.1:7402".parse().unwrap());
/// let config = NodeConfig::new(me);
/// let assignment = Arc::new(RingBucketAssignment::with_nodes(
///     config.bucket_count,
///     0,
///     [me, peer],
/// ));
///
/// let node = CacheNode::start_tcp(config, assignment, [peer]).await?;
/// let owner = LockOwnerIdentity::new("main");
/// let lock = node.read_write_lock("orders").write_lock(&owner);
/// lock.lock().await?;
/// lock.unlock().await?;
/// node.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CacheNode {
    config: NodeConfig,
    assignment: Arc<RingBucketAssignment>,
    handle: ProcessorHandle,
    listener: ProcessorEventListener,
    attachment: Attachment,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheNode {
    /// Start a node over a caller-supplied transport. The caller routes
    /// incoming envelopes to [`handle`](Self::handle) and reports
    /// membership through [`on_member_event`](Self::on_member_event).
    pub fn start(
        config: NodeConfig,
        assignment: Arc<RingBucketAssignment>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (handle, task) = Self::spawn_processor(&config, &assignment, transport)?;
        Ok(Self {
            listener: ProcessorEventListener::new(handle.clone()),
            config,
            assignment,
            handle,
            attachment: Attachment::External,
            task: Mutex::new(Some(task)),
        })
    }

    /// Start a node on an in-process network.
    pub fn join_local(
        config: NodeConfig,
        assignment: Arc<RingBucketAssignment>,
        network: &Arc<LocalNetwork>,
    ) -> Result<Self> {
        let (handle, task) = Self::spawn_processor(&config, &assignment, network.clone())?;
        network.register(handle.clone());
        Ok(Self {
            listener: ProcessorEventListener::new(handle.clone()),
            config,
            assignment,
            handle,
            attachment: Attachment::Local(network.clone()),
            task: Mutex::new(Some(task)),
        })
    }

    /// Start a node that listens on its own address and talks TCP to
    /// `members`.
    pub async fn start_tcp<I>(
        config: NodeConfig,
        assignment: Arc<RingBucketAssignment>,
        members: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = NodeAddress>,
    {
        let address = config.address;
        let members: Vec<NodeAddress> = members.into_iter().filter(|m| *m != address).collect();

        let transport = TcpTransport::new(address);
        for member in &members {
            transport.add_member(*member);
        }

        let (handle, task) = Self::spawn_processor(&config, &assignment, transport.clone())?;
        transport.attach(handle.clone());

        let (server, server_shutdown) = NetworkServer::new(address.addr, transport.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(node = %address, error = %e, "Network server error");
            }
        });

        info!(node = %address, members = members.len(), "Grid node started over TCP");
        Ok(Self {
            listener: ProcessorEventListener::new(handle.clone()).with_transport(transport.clone()),
            config,
            assignment,
            handle,
            attachment: Attachment::Tcp {
                transport,
                server_shutdown,
            },
            task: Mutex::new(Some(task)),
        })
    }

    fn spawn_processor(
        config: &NodeConfig,
        assignment: &Arc<RingBucketAssignment>,
        transport: Arc<dyn Transport>,
    ) -> Result<(ProcessorHandle, tokio::task::JoinHandle<()>)> {
        config.validate()?;
        let processor =
            ClusterProcessor::new(config.clone(), assignment.clone(), Arc::new(SystemClock))
                .with_members(assignment.nodes());
        info!(
            node = %config.address,
            buckets = config.bucket_count,
            "Starting grid node"
        );
        Ok(ProcessorRuntime::spawn(processor, transport))
    }

    pub fn address(&self) -> NodeAddress {
        self.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn assignment(&self) -> &Arc<RingBucketAssignment> {
        &self.assignment
    }

    /// Handle of the processor task.
    pub fn handle(&self) -> &ProcessorHandle {
        &self.handle
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        self.handle.metrics()
    }

    /// A partitioned cache hosted by this node.
    pub fn cache(&self, name: impl Into<String>) -> PartitionedCache {
        PartitionedCache::new(name, self.handle.clone(), self.config.clone())
    }

    /// A cluster-wide lock in the node's default region.
    pub fn read_write_lock(&self, key: impl Into<Binary>) -> ReadWriteLock {
        let lock = ReadWriteLock::new(
            self.handle.clone(),
            self.config.retry.clone(),
            self.config.lock.region.clone(),
            key.into(),
        );
        match self.config.lock.default_unlock_timeout {
            Some(timeout) => lock.with_unlock_timeout(timeout),
            None => lock,
        }
    }

    /// Apply a membership change reported by whatever detects them.
    ///
    /// The bucket ring learns about the member first, then the transport
    /// and the processor.
    pub fn on_member_event(&self, event: MemberEvent) {
        let address = event.address();
        if address == self.address() {
            return;
        }
        if event.is_join() {
            self.assignment.add_node(address);
        } else {
            self.assignment.remove_node(&address);
        }
        self.listener.on_event(event);
    }

    /// Stop the processor, the server and the transport.
    pub async fn shutdown(&self) {
        info!(node = %self.address(), "Shutting down grid node");
        match &self.attachment {
            Attachment::External => {}
            Attachment::Local(network) => {
                network.disconnect(self.address());
            }
            Attachment::Tcp {
                transport,
                server_shutdown,
            } => {
                let _ = server_shutdown.send(()).await;
                transport.shutdown().await;
            }
        }

        self.handle.shutdown().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(node = %self.address(), error = %e, "Processor task failed");
            }
        }
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("address", &self.config.address)
            .field("handle", &self.handle)
            .finish()
    }
}

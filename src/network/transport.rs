//! Transport seam between processors, and an in-process network.

use crate::error::{NetworkError, Result};
use crate::processor::ProcessorHandle;
use crate::types::NodeAddress;
use crate::wire::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Carries envelopes between processors.
///
/// Unicasts go to `header.receiver`. Multicasts go to every member,
/// including the sender, and every member must see all multicasts in the
/// same order.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Processors of one process connected through channels.
///
/// Multicast fan-out happens under a single lock, which gives all members
/// the same delivery order.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeAddress, ProcessorHandle>,
    order: Mutex<()>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a running processor. The new node and the existing nodes
    /// learn about each other.
    pub fn register(&self, handle: ProcessorHandle) {
        let _order = self.order.lock();
        let address = handle.address();
        for existing in self.nodes.iter() {
            if *existing.key() == address {
                continue;
            }
            let _ = existing.value().notify_node_joined(address);
            let _ = handle.notify_node_joined(*existing.key());
        }
        self.nodes.insert(address, handle);
        info!(node = %address, members = self.nodes.len(), "Node joined local network");
    }

    /// Disconnect a node. The remaining nodes see it leave.
    pub fn disconnect(&self, address: NodeAddress) -> Option<ProcessorHandle> {
        let _order = self.order.lock();
        let removed = self.nodes.remove(&address).map(|(_, handle)| handle);
        if removed.is_some() {
            for node in self.nodes.iter() {
                let _ = node.value().notify_node_left(address);
            }
            info!(node = %address, members = self.nodes.len(), "Node left local network");
        }
        removed
    }

    /// Connected nodes, lowest address first.
    pub fn members(&self) -> Vec<NodeAddress> {
        let mut members: Vec<NodeAddress> = self.nodes.iter().map(|n| *n.key()).collect();
        members.sort();
        members
    }

    pub fn handle(&self, address: &NodeAddress) -> Option<ProcessorHandle> {
        self.nodes.get(address).map(|n| n.value().clone())
    }

    fn broadcast(&self, envelope: Envelope) {
        let _order = self.order.lock();
        for address in self.members() {
            if let Some(node) = self.nodes.get(&address) {
                if node.value().deliver(envelope.clone()).is_err() {
                    warn!(node = %address, request_id = %envelope.id(), "Dropped multicast to stopped node");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        trace!(
            request_id = %envelope.id(),
            kind = %envelope.wireable_type(),
            sender = %envelope.header.sender,
            "Routing envelope"
        );
        match envelope.header.receiver {
            None => {
                self.broadcast(envelope);
                Ok(())
            }
            Some(receiver) => {
                let Some(node) = self.handle(&receiver) else {
                    debug!(receiver = %receiver, request_id = %envelope.id(), "Unknown receiver");
                    return Err(NetworkError::UnknownReceiver(receiver).into());
                };
                node.deliver(envelope)
                    .map_err(|_| NetworkError::ConnectionClosed.into())
            }
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("members", &self.members())
            .finish()
    }
}

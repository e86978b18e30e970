//! Cluster membership events.
//!
//! Membership itself is decided outside this crate. Whatever detects joins
//! and departures reports them as [`MemberEvent`]s to a
//! [`MemberEventListener`].

use crate::network::TcpTransport;
use crate::processor::ProcessorHandle;
use crate::types::NodeAddress;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Events related to cluster membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// A node joined the cluster.
    NodeJoin(NodeAddress),

    /// A node left the cluster gracefully.
    NodeLeave(NodeAddress),

    /// A node has been confirmed as failed.
    NodeFailed(NodeAddress),
}

impl MemberEvent {
    /// Get the node associated with this event.
    pub fn address(&self) -> NodeAddress {
        match self {
            MemberEvent::NodeJoin(address)
            | MemberEvent::NodeLeave(address)
            | MemberEvent::NodeFailed(address) => *address,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(self, MemberEvent::NodeJoin(_))
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(self, MemberEvent::NodeLeave(_) | MemberEvent::NodeFailed(_))
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::NodeJoin(address) => info!(node = %address, "Node joined cluster"),
            MemberEvent::NodeLeave(address) => info!(node = %address, "Node left cluster"),
            MemberEvent::NodeFailed(address) => warn!(node = %address, "Node confirmed failed"),
        }
    }
}

/// Feeds membership events to a processor, and to its TCP transport when
/// there is one.
pub struct ProcessorEventListener {
    handle: ProcessorHandle,
    transport: Option<Arc<TcpTransport>>,
}

impl ProcessorEventListener {
    pub fn new(handle: ProcessorHandle) -> Self {
        Self {
            handle,
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<TcpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl MemberEventListener for ProcessorEventListener {
    fn on_event(&self, event: MemberEvent) {
        let address = event.address();
        if address == self.handle.address() {
            return;
        }

        // The transport learns about a joiner first so the processor's
        // first messages to it can be routed; a leaver is dropped after the
        // processor has finished with it.
        let result = if event.is_join() {
            if let Some(transport) = &self.transport {
                transport.add_member(address);
            }
            self.handle.notify_node_joined(address)
        } else {
            let result = self.handle.notify_node_left(address);
            if let Some(transport) = &self.transport {
                transport.remove_member(address);
            }
            result
        };

        if let Err(e) = result {
            debug!(node = %address, error = %e, "Processor gone, membership event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        let join = MemberEvent::NodeJoin(NodeAddress::local(1));
        assert!(join.is_join());
        assert!(!join.is_leave());
        assert_eq!(join.address(), NodeAddress::local(1));

        let failed = MemberEvent::NodeFailed(NodeAddress::local(2));
        assert!(!failed.is_join());
        assert!(failed.is_leave());
    }

    #[tokio::test]
    async fn test_listener_updates_transport_members() {
        use crate::config::NodeConfig;
        use crate::partitioning::RingBucketAssignment;
        use crate::processor::{ClusterProcessor, ProcessorRuntime};
        use crate::types::SystemClock;

        let address = NodeAddress::local(3);
        let transport = TcpTransport::new(address);
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, [address]));
        let processor = ClusterProcessor::new(
            NodeConfig::new(address).with_bucket_count(16),
            assignment,
            Arc::new(SystemClock),
        );
        let (handle, _task) = ProcessorRuntime::spawn(processor, transport.clone());
        transport.attach(handle.clone());

        let listener = ProcessorEventListener::new(handle).with_transport(transport.clone());
        listener.on_event(MemberEvent::NodeJoin(NodeAddress::local(1)));
        assert_eq!(transport.sequencer(), NodeAddress::local(1));

        listener.on_event(MemberEvent::NodeFailed(NodeAddress::local(1)));
        assert!(transport.is_sequencer());

        listener.on_event(MemberEvent::NodeLeave(address));
        assert_eq!(transport.members(), vec![address]);
    }
}

//! Tokio task that owns a [`ClusterProcessor`].
//!
//! Everything that touches the processor goes through one unbounded inbox,
//! so the processor itself never locks. After each command or tick the
//! task hands the processor's outbound messages to the transport.

use crate::error::{Error, Result};
use crate::metrics::ProcessorMetrics;
use crate::network::Transport;
use crate::processor::engine::{ClusterProcessor, ProcessorState};
use crate::processor::local::LocalRequest;
use crate::processor::waiter::Completion;
use crate::subscription::EntryModifiedEvent;
use crate::types::NodeAddress;
use crate::wire::{Envelope, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Commands accepted by the processor task.
pub enum ProcessorCommand {
    /// A message arrived from the transport.
    Deliver(Envelope),
    /// A local request.
    Submit {
        request: LocalRequest,
        completion: Completion,
    },
    NodeJoined(NodeAddress),
    NodeLeft(NodeAddress),
    SetState(ProcessorState),
    /// An entry of a cache stored on this node changed.
    EntryModified {
        cache_name: String,
        event: EntryModifiedEvent,
    },
    /// Stop the task, acknowledging on the sender.
    Shutdown(oneshot::Sender<()>),
}

impl fmt::Debug for ProcessorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorCommand::Deliver(envelope) => f.debug_tuple("Deliver").field(&envelope.id()).finish(),
            ProcessorCommand::Submit { request, .. } => f.debug_tuple("Submit").field(&request.kind()).finish(),
            ProcessorCommand::NodeJoined(address) => f.debug_tuple("NodeJoined").field(address).finish(),
            ProcessorCommand::NodeLeft(address) => f.debug_tuple("NodeLeft").field(address).finish(),
            ProcessorCommand::SetState(state) => f.debug_tuple("SetState").field(state).finish(),
            ProcessorCommand::EntryModified { cache_name, .. } => {
                f.debug_tuple("EntryModified").field(cache_name).finish()
            }
            ProcessorCommand::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable handle to a running processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    address: NodeAddress,
    tx: mpsc::UnboundedSender<ProcessorCommand>,
    request_timeout: Duration,
    metrics: Arc<ProcessorMetrics>,
}

impl ProcessorHandle {
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.metrics
    }

    /// Time [`ProcessorHandle::execute`] waits for a response.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether the processor task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: ProcessorCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::Shutdown)
    }

    /// Hand a message from the transport to the processor.
    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.send(ProcessorCommand::Deliver(envelope))
    }

    pub fn notify_node_joined(&self, address: NodeAddress) -> Result<()> {
        self.send(ProcessorCommand::NodeJoined(address))
    }

    pub fn notify_node_left(&self, address: NodeAddress) -> Result<()> {
        self.send(ProcessorCommand::NodeLeft(address))
    }

    pub fn set_state(&self, state: ProcessorState) -> Result<()> {
        self.send(ProcessorCommand::SetState(state))
    }

    pub fn notify_entry_modified(
        &self,
        cache_name: impl Into<String>,
        event: EntryModifiedEvent,
    ) -> Result<()> {
        self.send(ProcessorCommand::EntryModified {
            cache_name: cache_name.into(),
            event,
        })
    }

    /// Run a local request, waiting at most the configured request timeout.
    pub async fn execute(&self, request: LocalRequest) -> Result<Response> {
        self.execute_within(request, Some(self.request_timeout)).await
    }

    /// Run a local request. When `timeout` elapses first the call fails
    /// with [`Error::Retry`], or with [`Error::Timeout`] if the request is
    /// not repeatable; None waits for the final response.
    pub async fn execute_within(
        &self,
        request: LocalRequest,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let repeatable = request.is_repeatable();
        let (completion, rx) = oneshot::channel();
        self.send(ProcessorCommand::Submit {
            request,
            completion,
        })?;

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(node = %self.address, ?timeout, repeatable, "Local request timed out");
                    if !repeatable {
                        return Err(Error::Timeout);
                    }
                    return Err(Error::retry("local request timed out"));
                }
            },
            None => rx.await,
        };
        received.map_err(|_| Error::Shutdown)
    }

    /// Stop the processor task and wait for it to acknowledge.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(ProcessorCommand::Shutdown(tx)).is_err() {
            return;
        }
        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(())) => info!(node = %self.address, "Processor shutdown complete"),
            Ok(Err(_)) => warn!(node = %self.address, "Shutdown channel dropped"),
            Err(_) => warn!(node = %self.address, "Processor shutdown timeout"),
        }
    }
}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("address", &self.address)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Drives a processor from a tokio task.
pub struct ProcessorRuntime;

impl ProcessorRuntime {
    /// Spawn the processor task.
    pub fn spawn(
        processor: ClusterProcessor,
        transport: Arc<dyn Transport>,
    ) -> (ProcessorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProcessorHandle {
            address: processor.address(),
            tx,
            request_timeout: processor.config().processor.default_request_timeout,
            metrics: processor.metrics().clone(),
        };
        let task = tokio::spawn(Self::run(processor, rx, transport));
        (handle, task)
    }

    async fn run(
        mut processor: ClusterProcessor,
        mut rx: mpsc::UnboundedReceiver<ProcessorCommand>,
        transport: Arc<dyn Transport>,
    ) {
        let address = processor.address();
        let mut ticker = interval(processor.config().processor.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(node = %address, "Processor started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(ProcessorCommand::Shutdown(ack)) => {
                        info!(node = %address, "Received shutdown command");
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => Self::apply(&mut processor, command),
                    None => break,
                },
                _ = ticker.tick() => processor.tick(),
            }

            for envelope in processor.drain_outbound() {
                let id = envelope.id();
                if let Err(e) = transport.send(envelope).await {
                    error!(node = %address, request_id = %id, error = %e, "Failed to send message");
                }
            }
        }

        info!(node = %address, "Processor stopped");
    }

    fn apply(processor: &mut ClusterProcessor, command: ProcessorCommand) {
        match command {
            ProcessorCommand::Deliver(envelope) => processor.receive(envelope),
            ProcessorCommand::Submit {
                request,
                completion,
            } => {
                processor.submit(request, completion);
            }
            ProcessorCommand::NodeJoined(address) => processor.notify_node_joined(address),
            ProcessorCommand::NodeLeft(address) => processor.notify_node_left(address),
            ProcessorCommand::SetState(state) => processor.set_state(state),
            ProcessorCommand::EntryModified { cache_name, event } => {
                processor.notify_entry_modified(&cache_name, event);
            }
            ProcessorCommand::Shutdown(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::lock::LockRequest;
    use crate::network::LocalNetwork;
    use crate::partitioning::RingBucketAssignment;
    use crate::types::{Binary, SystemClock};
    use crate::wire::{LockResult, ResponsePayload, ResultCode};

    fn spawn_single() -> (ProcessorHandle, JoinHandle<()>, Arc<LocalNetwork>) {
        let address = NodeAddress::local(1);
        let config = NodeConfig::new(address).with_bucket_count(16);
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, [address]));
        let processor = ClusterProcessor::new(config, assignment, Arc::new(SystemClock));
        let network = LocalNetwork::new();
        let (handle, task) = ProcessorRuntime::spawn(processor, network.clone());
        network.register(handle.clone());
        (handle, task, network)
    }

    fn lock() -> LockRequest {
        LockRequest::new("r", Binary::from_static(b"k"), NodeAddress::local(1), 1, "main", false)
    }

    #[tokio::test]
    async fn test_execute_through_runtime() {
        let (handle, task, _network) = spawn_single();

        let response = handle
            .execute(LocalRequest::AcquireLock {
                lock: lock(),
                timeout: None,
                unlock_timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(response.payload, ResponsePayload::Lock(LockResult::Granted));

        let response = handle.execute(LocalRequest::EntryCount { lock: lock() }).await.unwrap();
        assert_eq!(response.payload, ResponsePayload::EntryCount(1));

        handle.shutdown().await;
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.execute(LocalRequest::EntryCount { lock: lock() }).await,
            Err(Error::Shutdown)
        ));
    }

    /// Accepts every envelope and delivers none.
    struct BlackHole;

    #[async_trait::async_trait]
    impl Transport for BlackHole {
        async fn send(&self, _envelope: Envelope) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lost_acquire_times_out_without_retry() {
        let address = NodeAddress::local(1);
        let config = NodeConfig::new(address).with_bucket_count(16);
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, [address]));
        let processor = ClusterProcessor::new(config, assignment, Arc::new(SystemClock));
        let (handle, _task) = ProcessorRuntime::spawn(processor, Arc::new(BlackHole));

        let result = handle
            .execute_within(
                LocalRequest::AcquireLock {
                    lock: lock(),
                    timeout: None,
                    unlock_timeout: None,
                },
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_state_answers_retry() {
        let (handle, _task, _network) = spawn_single();
        handle.set_state(ProcessorState::Blocked).unwrap();

        let response = handle.execute(LocalRequest::EntryCount { lock: lock() }).await.unwrap();
        assert_eq!(response.code, ResultCode::Retry);
    }
}

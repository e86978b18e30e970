//! TCP server that feeds incoming envelopes to a handler.

use crate::error::{NetworkError, Result};
use crate::processor::ProcessorHandle;
use crate::wire::{read_frame, Envelope};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Handler for incoming envelopes.
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Accept one envelope. An error closes the connection it came from.
    fn handle(&self, envelope: Envelope) -> Result<()>;
}

impl EnvelopeHandler for ProcessorHandle {
    fn handle(&self, envelope: Envelope) -> Result<()> {
        self.deliver(envelope)
    }
}

/// TCP server for processor traffic.
pub struct NetworkServer {
    /// Address to bind to.
    bind_addr: SocketAddr,

    /// Envelope handler.
    handler: Arc<dyn EnvelopeHandler>,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Create a new network server.
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn EnvelopeHandler>) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            bind_addr,
            handler,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::from)?;

        info!(addr = %self.bind_addr, "Network server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        while let Some(envelope) = read_frame(&mut stream).await? {
            trace!(
                request_id = %envelope.id(),
                kind = %envelope.wireable_type(),
                sender = %envelope.header.sender,
                "Received envelope"
            );
            handler.handle(envelope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{EntryCountRequest, LockRequest};
    use crate::types::{Binary, NodeAddress};
    use crate::wire::{frame_envelope, Payload};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<Envelope>>,
    }

    impl EnvelopeHandler for RecordingHandler {
        fn handle(&self, envelope: Envelope) -> Result<()> {
            self.received.lock().push(envelope);
            Ok(())
        }
    }

    async fn allocate_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn entry_count(thread: u64) -> Envelope {
        let node = NodeAddress::local(1);
        let lock = LockRequest::new("r", Binary::from_static(b"k"), node, thread, "t", false);
        Envelope::request(node, node, Payload::EntryCount(EntryCountRequest::new(lock)))
    }

    #[tokio::test]
    async fn test_server_delivers_frames_in_order() {
        let addr = allocate_addr().await;
        let handler = Arc::new(RecordingHandler::default());
        let (server, shutdown_tx) = NetworkServer::new(addr, handler.clone());
        let server_handle = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = entry_count(1);
        let second = entry_count(2);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&frame_envelope(&first).unwrap()).await.unwrap();
        stream.write_all(&frame_envelope(&second).unwrap()).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*handler.received.lock(), vec![first, second]);

        shutdown_tx.send(()).await.unwrap();
        server_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let addr = allocate_addr().await;
        let handler = Arc::new(RecordingHandler::default());
        let (server, shutdown_tx) = NetworkServer::new(addr, handler.clone());
        let server_handle = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&3u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        stream.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handler.received.lock().is_empty());

        shutdown_tx.send(()).await.unwrap();
        server_handle.await.unwrap().unwrap();
    }
}

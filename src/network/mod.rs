//! Network layer between processors.
//!
//! [`Transport`] is the only thing a processor needs from the network.
//! [`LocalNetwork`] connects processors of one process; [`TcpTransport`]
//! and [`NetworkServer`] connect processes.

pub mod server;
pub mod tcp;
pub mod transport;

pub use server::{EnvelopeHandler, NetworkServer};
pub use tcp::{TcpTransport, TransportConfig, TransportMetrics};
pub use transport::{LocalNetwork, Transport};

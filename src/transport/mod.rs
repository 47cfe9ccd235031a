//! Transport providers
//!
//! The networking core never touches sockets directly. It drives an injected
//! [`TransportProvider`] that owns raw sessions and reports everything that
//! happens on them as [`TransportEvent`]s over a channel.
//!
//! # Adapters
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process hub for tests and
//!   simulations, supports direct and relay-style dialing
//! - [`TcpTransport`]: tokio TCP sessions with optional UPnP port mapping

pub mod memory;
pub mod nat;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use nat::{NatDetector, NatStatus};
pub use tcp::TcpTransport;

use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;

// =============================================================================
// Constants
// =============================================================================

/// Largest chunk handed to a session in one call
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Frames are dropped once a session has this many chunks queued
pub const MAX_SEND_BUFFER: usize = 10240;

/// Session identifier, 0 means "no session"
pub type SessionId = u32;

/// NAT type reported by the provider
pub const NAT_TYPE_UNKNOWN: u32 = 0;
pub const NAT_TYPE_PUBLIC: u32 = 1;
pub const NAT_TYPE_MAPPED: u32 = 2;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not configured")]
    NotConfigured,
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("Outbound queue full for session {0}")]
    QueueFull(SessionId),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Address in use: {0}")]
    AddressInUse(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Transport closed")]
    Closed,
}

// =============================================================================
// Events
// =============================================================================

/// Everything the provider reports back to the core
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bytes arrived on a session; chunk boundaries carry no meaning
    Received {
        net_id: u64,
        session: SessionId,
        data: Vec<u8>,
    },
    /// An outbound dial completed
    Connected { net_id: u64, session: SessionId },
    /// An inbound session was accepted
    Accepted { net_id: u64, session: SessionId },
    /// A session closed, or a dial failed (session 0)
    Disconnected { net_id: u64, session: SessionId },
    /// The session flushed its outbound queue
    SendQueueDrained { net_id: u64, session: SessionId },
    /// Local NAT situation was determined
    NatTypeChecked {
        nat_type: u32,
        private_ip: Option<IpAddr>,
        public_ip: Option<IpAddr>,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

// =============================================================================
// Provider
// =============================================================================

/// Session-oriented byte transport.
///
/// Calls never block: dials and writes complete asynchronously and are
/// reported through the configured event channel.
pub trait TransportProvider: Send + Sync {
    /// Register our numeric id and where to deliver events
    fn configure(&self, net_id: u64, events: EventSender) -> Result<(), TransportError>;

    /// Accept sessions on a local address
    fn listen_direct(&self, ip: IpAddr, port: u16) -> Result<(), TransportError>;

    /// Register with a relay server and accept sessions through it
    fn listen_via_relay(&self, relay_ip: IpAddr, relay_port: u16) -> Result<(), TransportError>;

    /// Dial the node with numeric id `net_id` at `ip:port` (a relay server
    /// when NAT traversal is on)
    fn connect(&self, net_id: u64, ip: IpAddr, port: u16) -> Result<(), TransportError>;

    /// Queue one chunk on a session
    fn send(&self, session: SessionId, data: &[u8]) -> Result<(), TransportError>;

    fn shutdown(&self, session: SessionId);

    /// Chunks waiting to be written on a session
    fn outbound_queue_depth(&self, session: SessionId) -> usize;

    fn close(&self);

    /// Send a whole frame, split into [`MAX_CHUNK_SIZE`] chunks.
    ///
    /// The frame is dropped when the session already holds more than
    /// [`MAX_SEND_BUFFER`] queued chunks.
    fn send_chunked(&self, session: SessionId, data: &[u8]) -> Result<(), TransportError> {
        let depth = self.outbound_queue_depth(session);
        if depth > MAX_SEND_BUFFER {
            log::warn!(
                "session {} outbound queue depth {} over limit, dropping {} bytes",
                session,
                depth,
                data.len()
            );
            return Err(TransportError::QueueFull(session));
        }
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            self.send(session, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        depth: usize,
        sent: Mutex<Vec<usize>>,
    }

    impl TransportProvider for RecordingTransport {
        fn configure(&self, _: u64, _: EventSender) -> Result<(), TransportError> {
            Ok(())
        }
        fn listen_direct(&self, _: IpAddr, _: u16) -> Result<(), TransportError> {
            Ok(())
        }
        fn listen_via_relay(&self, _: IpAddr, _: u16) -> Result<(), TransportError> {
            Err(TransportError::Unsupported("relay"))
        }
        fn connect(&self, _: u64, _: IpAddr, _: u16) -> Result<(), TransportError> {
            Ok(())
        }
        fn send(&self, _: SessionId, data: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(data.len());
            Ok(())
        }
        fn shutdown(&self, _: SessionId) {}
        fn outbound_queue_depth(&self, _: SessionId) -> usize {
            self.depth
        }
        fn close(&self) {}
    }

    #[test]
    fn test_send_chunked_splits_frames() {
        let transport = RecordingTransport::default();
        let frame = vec![0u8; MAX_CHUNK_SIZE * 2 + 10];
        transport.send_chunked(1, &frame).unwrap();
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 10]
        );
    }

    #[test]
    fn test_send_chunked_drops_on_deep_queue() {
        let transport = RecordingTransport {
            depth: MAX_SEND_BUFFER + 1,
            ..Default::default()
        };
        assert!(matches!(
            transport.send_chunked(1, b"frame"),
            Err(TransportError::QueueFull(1))
        ));
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}

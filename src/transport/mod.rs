//! Transport abstraction (C1): typed request/reply, publish/subscribe, and
//! streaming channels over the message-passing substrate.
//!
//! Nothing above this module names a concrete transport; unit tests wire up
//! [`InMemoryTransport`] while the two physical machines talk over
//! [`TcpTransport`]. Both implement the same trait objects.

pub mod in_memory;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`Transport`] implementation.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The deadline elapsed before a reply arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer could not be reached (connection refused, reset, or no
    /// route).
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The peer responded with a message that did not conform to the
    /// expected wire schema.
    #[error("peer protocol error: {0}")]
    PeerProtocolError(String),

    /// The request was canceled by the caller before a reply arrived.
    #[error("request canceled")]
    Canceled,

    /// The named topic or endpoint does not exist on this transport.
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
}

/// One request/reply exchange: send exactly one message, receive exactly one
/// reply or a transport error.
#[async_trait]
pub trait RequestReply: Send + Sync {
    /// Sends `payload` (already serialized to bytes by the caller) to
    /// `destination` and waits up to `timeout` for a reply.
    async fn request(
        &self,
        destination: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// A best-effort publish/subscribe topic.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes `payload` to `topic`. Delivery is best-effort; a lagging or
    /// absent subscriber does not block the publisher.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribes to `topic`, returning a channel of future publications.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<Vec<u8>>, TransportError>;
}

/// An ordered, unidirectional sequence of messages (audio frames, token
/// streams). Terminates with `Ok(None)` on end-of-stream.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Sends the next frame.
    async fn send_frame(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Signals that no more frames will be sent.
    async fn close(&self) -> Result<(), TransportError>;
}

pub use in_memory::InMemoryTransport;
pub use tcp::TcpTransport;

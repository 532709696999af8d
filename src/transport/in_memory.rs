//! In-process transport used by unit tests and by agents co-located with the
//! coordinator. Backed by `tokio::sync::mpsc`/`broadcast`, never touching the
//! network, so tests run deterministically and fast.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{MessageStream, PubSub, RequestReply, TransportError};

type Responder = oneshot::Sender<Vec<u8>>;

/// An in-memory `RequestReply` + `PubSub` transport.
///
/// Destinations register a handler channel; `request` sends the payload
/// down that channel paired with a `oneshot` responder, mirroring how a
/// local agent would receive a call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    handlers: Arc<DashMap<String, mpsc::Sender<(Vec<u8>, Responder)>>>,
    topics: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryTransport {
    /// Creates an empty transport with no registered destinations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `destination` as a request/reply target, returning the
    /// receiving half the caller should drive in a loop.
    pub fn register(&self, destination: &str) -> mpsc::Receiver<(Vec<u8>, Responder)> {
        let (tx, rx) = mpsc::channel(64);
        self.handlers.insert(destination.to_string(), tx);
        rx
    }
}

#[async_trait]
impl RequestReply for InMemoryTransport {
    async fn request(
        &self,
        destination: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let handler = self
            .handlers
            .get(destination)
            .ok_or_else(|| TransportError::UnknownDestination(destination.to_string()))?
            .clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        handler
            .send((payload, reply_tx))
            .await
            .map_err(|_| TransportError::PeerUnreachable(destination.to_string()))?;
        tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|_| TransportError::Canceled)
    }
}

#[async_trait]
impl PubSub for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if let Some(sender) = self.topics.get(topic) {
            // A publish with no live receivers is not an error: best-effort
            // delivery means lagging/absent subscribers are dropped silently.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let sender = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Ok(msg) = broadcast_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// An in-memory unidirectional stream, backed by a bounded `mpsc` channel.
pub struct InMemoryStream {
    sender: mpsc::Sender<Vec<u8>>,
}

impl InMemoryStream {
    /// Creates a stream pair; the receiver end is handed to the consumer.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { sender: tx }, rx)
    }
}

#[async_trait]
impl MessageStream for InMemoryStream {
    async fn send_frame(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| TransportError::PeerUnreachable("stream closed".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender (by letting this struct go out of scope) is
        // how end-of-stream is signaled; nothing further to do here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reply_round_trips() {
        let transport = InMemoryTransport::new();
        let mut rx = transport.register("echo");
        tokio::spawn(async move {
            while let Some((payload, responder)) = rx.recv().await {
                let _ = responder.send(payload);
            }
        });

        let reply = transport
            .request("echo", b"hello".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"hello");
    }

    #[tokio::test]
    async fn request_to_unknown_destination_fails() {
        let transport = InMemoryTransport::new();
        let err = transport
            .request("nobody", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownDestination(_)));
    }

    #[tokio::test]
    async fn request_times_out_when_handler_never_replies() {
        let transport = InMemoryTransport::new();
        let mut rx = transport.register("slow");
        tokio::spawn(async move {
            // Hold the message without ever responding.
            let _held = rx.recv().await;
            std::future::pending::<()>().await;
        });

        let err = transport
            .request("slow", vec![], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let transport = InMemoryTransport::new();
        assert!(transport.publish("no-subs", vec![1, 2, 3]).await.is_ok());
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages() {
        let transport = InMemoryTransport::new();
        let mut rx = transport.subscribe("topic").await.unwrap();
        transport.publish("topic", b"hi".to_vec()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"hi");
    }
}

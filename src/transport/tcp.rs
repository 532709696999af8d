//! TCP transport used across the two physical machines: length-prefixed
//! frames over `tokio::net::TcpStream`. Implements the same trait objects as
//! [`super::InMemoryTransport`] so callers never branch on transport kind.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{RequestReply, TransportError};

/// A connect-per-request TCP transport.
///
/// Reconnect-with-backoff is the caller's responsibility at a higher layer
/// (the Cross-Machine Router and Request Coordinator both sit behind a
/// [`crate::circuit_breaker`]); this type only frames one exchange.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates a new TCP transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| TransportError::PeerProtocolError("frame too large".to_string()))?;
        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::PeerUnreachable(e.to_string()))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| TransportError::PeerUnreachable(e.to_string()))?;
        Ok(())
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::PeerUnreachable(e.to_string()))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::PeerUnreachable(e.to_string()))?;
        Ok(buf)
    }
}

#[async_trait]
impl RequestReply for TcpTransport {
    async fn request(
        &self,
        destination: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        tokio::time::timeout(timeout, async move {
            let mut stream = TcpStream::connect(destination)
                .await
                .map_err(|e| TransportError::PeerUnreachable(e.to_string()))?;
            Self::write_frame(&mut stream, &payload).await?;
            Self::read_frame(&mut stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = TcpTransport::read_frame(&mut stream).await.unwrap();
            TcpTransport::write_frame(&mut stream, &frame).await.unwrap();
        });

        let transport = TcpTransport::new();
        let reply = transport
            .request(&addr.to_string(), b"ping".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn request_to_closed_port_is_peer_unreachable() {
        let transport = TcpTransport::new();
        let err = transport
            .request("127.0.0.1:1", vec![], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::PeerUnreachable(_) | TransportError::Timeout(_)
        ));
    }
}

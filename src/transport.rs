//! Transport boundary between the engine and the embedder's connection layer.
//!
//! The engine never opens sockets. The embedder accepts connections, runs its
//! own handshake, heartbeat and reconnection machinery, and hands each
//! established connection to [`crate::Server::attach`] as a [`Transport`]: an
//! ordered bidirectional stream of text and binary frames. One transport is
//! one physical client connection; every namespace that client joins is
//! multiplexed over it.
//!
//! Frame order is part of the protocol. Implementations must deliver frames
//! in arrival order, because binary attachments directly follow the text
//! frame that declared them.
//!
//! [`memory_pair`] provides an in-process implementation for tests and for
//! embedders that drive the engine without a network layer.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    /// UTF-8 text frame: packet header plus JSON payload.
    Text(String),
    /// Raw binary frame: one packet attachment.
    Binary(Bytes),
}

/// Errors surfaced by a transport implementation.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is closed; no more frames will flow.
    Closed,
    /// The underlying connection failed.
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Connection closed"),
            Self::Io(msg) => write!(f, "Transport error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// An established client connection supplied by the embedder.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is gone, or
    /// [`TransportError::Io`] for an underlying failure.
    async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError>;

    /// Receive the next frame from the client.
    ///
    /// Blocks until a frame is available. Must be cancellation safe: the
    /// engine polls this inside a `select!` loop and drops the in-flight
    /// future whenever an outbound packet wins the race.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the connection has closed.
    async fn recv(&mut self) -> Result<TransportFrame, TransportError>;

    /// Close the connection. Subsequent sends and receives fail with
    /// [`TransportError::Closed`].
    async fn close(&mut self);
}

/// Create a connected in-memory transport pair.
///
/// The [`MemoryTransport`] is the server side, ready for
/// [`crate::Server::attach`]. The [`MemoryClient`] plays the remote peer:
/// frames the engine sends surface there, and frames it sends reach the
/// engine. Dropping the client closes the connection from the peer side.
pub fn memory_pair() -> (MemoryTransport, MemoryClient) {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(to_client),
            rx: from_client,
        },
        MemoryClient {
            tx: to_server,
            rx: from_server,
        },
    )
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<TransportFrame>>,
    rx: mpsc::UnboundedReceiver<TransportFrame>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<TransportFrame, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// Peer side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<TransportFrame>,
    rx: mpsc::UnboundedReceiver<TransportFrame>,
}

impl MemoryClient {
    /// Send a text frame to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the engine side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(TransportFrame::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Send a binary frame to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the engine side is gone.
    pub fn send_binary(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(TransportFrame::Binary(bytes))
            .map_err(|_| TransportError::Closed)
    }

    /// Receive the next frame from the engine, or `None` once the engine has
    /// closed the connection.
    pub async fn next_frame(&mut self) -> Option<TransportFrame> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut server, mut client) = memory_pair();

        client.send_text("0").unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            TransportFrame::Text("0".to_string())
        );

        server
            .send(TransportFrame::Binary(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        assert_eq!(
            client.next_frame().await,
            Some(TransportFrame::Binary(Bytes::from_static(b"abc")))
        );
    }

    #[tokio::test]
    async fn test_dropping_client_closes_server_recv() {
        let (mut server, client) = memory_pair();
        drop(client);
        assert!(matches!(server.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_server_close_reaches_client() {
        let (mut server, mut client) = memory_pair();
        server.close().await;

        assert!(matches!(
            server.send(TransportFrame::Text("2".into())).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(client.next_frame().await, None);
    }
}

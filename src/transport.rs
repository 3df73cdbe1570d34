//! The stream-transport capability the direct channel consumes, plus an
//! in-process implementation used by tests and demos.
//!
//! The contract mirrors a libp2p-style host: register a handler under a
//! protocol identifier, dial a peer under that identifier, get back one
//! duplex byte stream per exchange. A dial to a peer that has no handler for
//! the protocol fails with `UnsupportedProtocol`, which the sync engine
//! tolerates silently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Opaque peer identifier.
pub type PeerId = String;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote peer is reachable but does not speak the protocol.
    #[error("peer {0} does not support {1}")]
    UnsupportedProtocol(PeerId, String),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("dial cancelled")]
    Cancelled,
    #[error("protocol {0} is already handled")]
    AlreadyHandled(String),
    #[error("io: {0}")]
    Io(String),
}

/// One end of a duplex byte stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> RawStream for T {}

/// An accepted stream together with the dialing peer.
pub struct IncomingStream {
    pub remote_peer: PeerId,
    pub stream: Box<dyn RawStream>,
}

/// Stream-based transport: dial out, accept in, all scoped by protocol
/// identifier.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Register a handler: accepted streams for `protocol` are delivered on
    /// `incoming`.
    async fn handle(
        &self,
        protocol: &str,
        incoming: mpsc::Sender<IncomingStream>,
    ) -> Result<(), TransportError>;

    /// Remove the handler for `protocol`.
    async fn unhandle(&self, protocol: &str) -> Result<(), TransportError>;

    /// Open a stream to `peer` under `protocol`. The dial aborts when
    /// `cancel` fires.
    async fn dial(
        &self,
        peer: &PeerId,
        protocol: &str,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RawStream>, TransportError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

/// Shared wiring for a set of in-process peers. Each peer endpoint holds a
/// clone of the hub; dialing looks the target handler up and hands it one
/// half of a duplex pipe.
#[derive(Default)]
pub struct MemoryHub {
    handlers: Mutex<HashMap<(PeerId, String), mpsc::Sender<IncomingStream>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A single peer's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    local_peer: PeerId,
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(local_peer: impl Into<PeerId>, hub: Arc<MemoryHub>) -> Self {
        MemoryTransport { local_peer: local_peer.into(), hub }
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn handle(
        &self,
        protocol: &str,
        incoming: mpsc::Sender<IncomingStream>,
    ) -> Result<(), TransportError> {
        let mut handlers = self.hub.handlers.lock().await;
        let key = (self.local_peer.clone(), protocol.to_string());
        if handlers.contains_key(&key) {
            return Err(TransportError::AlreadyHandled(protocol.to_string()));
        }
        handlers.insert(key, incoming);
        Ok(())
    }

    async fn unhandle(&self, protocol: &str) -> Result<(), TransportError> {
        let mut handlers = self.hub.handlers.lock().await;
        handlers.remove(&(self.local_peer.clone(), protocol.to_string()));
        Ok(())
    }

    async fn dial(
        &self,
        peer: &PeerId,
        protocol: &str,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RawStream>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let handler = {
            let handlers = self.hub.handlers.lock().await;
            handlers
                .get(&(peer.clone(), protocol.to_string()))
                .cloned()
                .ok_or_else(|| {
                    TransportError::UnsupportedProtocol(peer.clone(), protocol.to_string())
                })?
        };

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        handler
            .send(IncomingStream {
                remote_peer: self.local_peer.clone(),
                stream: Box::new(theirs),
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;

        Ok(Box::new(ours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_registered_handler() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new("peer-a", hub.clone());
        let b = MemoryTransport::new("peer-b", hub.clone());

        let (tx, mut rx) = mpsc::channel(4);
        b.handle("/test/1.0.0", tx).await.unwrap();

        let mut stream = a
            .dial(&"peer-b".to_string(), "/test/1.0.0", CancellationToken::new())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.remote_peer, "peer-a");
        let mut buf = Vec::new();
        accepted.stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn dialing_unhandled_protocol_is_unsupported() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new("peer-a", hub.clone());
        let _b = MemoryTransport::new("peer-b", hub.clone());

        let err = a
            .dial(&"peer-b".to_string(), "/test/1.0.0", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedProtocol(..)));
    }

    #[tokio::test]
    async fn cancelled_dial_aborts() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new("peer-a", hub.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = a
            .dial(&"peer-b".to_string(), "/test/1.0.0", cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn unhandle_removes_the_protocol() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::new("peer-a", hub.clone());
        let b = MemoryTransport::new("peer-b", hub.clone());

        let (tx, _rx) = mpsc::channel(4);
        b.handle("/test/1.0.0", tx).await.unwrap();
        b.unhandle("/test/1.0.0").await.unwrap();

        let err = a
            .dial(&"peer-b".to_string(), "/test/1.0.0", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedProtocol(..)));
    }

    #[tokio::test]
    async fn double_handle_is_rejected() {
        let hub = MemoryHub::new();
        let b = MemoryTransport::new("peer-b", hub);
        let (tx, _rx) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        b.handle("/test/1.0.0", tx).await.unwrap();
        assert!(matches!(
            b.handle("/test/1.0.0", tx2).await,
            Err(TransportError::AlreadyHandled(_))
        ));
    }
}

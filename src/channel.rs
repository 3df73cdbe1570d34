//! Direct channel: a one-shot, length-prefixed exchange over a single
//! duplex stream.
//!
//! Wire format: an unsigned varint (LEB128) carrying the payload length,
//! then the payload, then end-of-stream. A receiver that reads a length the
//! payload does not match drops the message silently and closes the stream.

use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{PeerId, StreamTransport, TransportError};

/// Protocol identifier, fixed for wire compatibility with existing peers.
pub const PROTOCOL: &str = "/go-orbit-db/direct-channel/1.2.0";

/// Longest accepted length prefix (LEB128 for a full u64).
const MAX_VARINT_BYTES: usize = 10;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io: {0}")]
    Io(String),
}

/// Frame-level failures. Only surfaced to the receive loop, which drops the
/// message without emitting an event.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("length prefix too long")]
    VarintTooLong,
    #[error("announced {announced} bytes, received {received}")]
    LengthMismatch { announced: u64, received: u64 },
    #[error("io: {0}")]
    Io(String),
}

// ─── Varint framing ──────────────────────────────────────────────────────────

/// Encode a length prefix.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::u64_buffer();
    unsigned_varint::encode::u64(value, &mut buf).to_vec()
}

/// Decode a length prefix from the front of `bytes`, returning the value and
/// the number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), FrameError> {
    let (value, rest) =
        unsigned_varint::decode::u64(bytes).map_err(|e| FrameError::Io(e.to_string()))?;
    Ok((value, bytes.len() - rest.len()))
}

/// Write the two frames of one exchange and close the write side.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
) -> Result<(), ChannelError> {
    let prefix = encode_varint(payload.len() as u64);
    stream.write_all(&prefix).await.map_err(|e| ChannelError::Io(e.to_string()))?;
    stream.write_all(payload).await.map_err(|e| ChannelError::Io(e.to_string()))?;
    stream.shutdown().await.map_err(|e| ChannelError::Io(e.to_string()))?;
    Ok(())
}

/// Read one exchange: the length prefix, then the stream to its end. Fails
/// when the announced and received lengths disagree.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; 1];
    let mut collected = Vec::with_capacity(MAX_VARINT_BYTES);
    let announced = loop {
        stream
            .read_exact(&mut prefix)
            .await
            .map_err(|e| FrameError::Io(e.to_string()))?;
        collected.push(prefix[0]);
        if prefix[0] & 0x80 == 0 {
            break decode_varint(&collected)?.0;
        }
        if collected.len() >= MAX_VARINT_BYTES {
            return Err(FrameError::VarintTooLong);
        }
    };

    // Consume the stream greedily; the sender closes after the payload.
    let mut payload = Vec::new();
    stream
        .read_to_end(&mut payload)
        .await
        .map_err(|e| FrameError::Io(e.to_string()))?;

    if payload.len() as u64 != announced {
        return Err(FrameError::LengthMismatch {
            announced,
            received: payload.len() as u64,
        });
    }
    Ok(payload)
}

// ─── Direct channel ──────────────────────────────────────────────────────────

/// A message accepted on the direct channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub remote_peer: PeerId,
    pub bytes: Vec<u8>,
}

/// The direct channel: listens under [`PROTOCOL`] and sends one-shot framed
/// messages to peers.
pub struct DirectChannel {
    transport: Arc<dyn StreamTransport>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectChannel {
    /// Register the protocol handler and start accepting streams. Each
    /// accepted stream is decoded once; well-formed messages are delivered
    /// on `messages`, malformed ones dropped silently.
    pub async fn listen(
        transport: Arc<dyn StreamTransport>,
        messages: mpsc::Sender<ChannelMessage>,
    ) -> Result<DirectChannel, ChannelError> {
        let (tx, mut rx) = mpsc::channel(32);
        transport.handle(PROTOCOL, tx).await?;

        let accept_task = tokio::spawn(async move {
            while let Some(mut incoming) = rx.recv().await {
                match read_frame(&mut incoming.stream).await {
                    Ok(bytes) => {
                        let delivered = messages
                            .send(ChannelMessage { remote_peer: incoming.remote_peer, bytes })
                            .await;
                        if delivered.is_err() {
                            break; // listener gone
                        }
                    }
                    Err(err) => {
                        debug!("direct-channel: dropping frame from {}: {err}", incoming.remote_peer);
                    }
                }
            }
        });

        Ok(DirectChannel { transport, accept_task: Mutex::new(Some(accept_task)) })
    }

    /// Dial `peer` and send one framed message. Transport errors propagate
    /// to the caller.
    pub async fn send(
        &self,
        peer: &PeerId,
        bytes: &[u8],
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let mut stream = self.transport.dial(peer, PROTOCOL, cancel).await?;
        write_frame(&mut stream, bytes).await
    }

    /// Unregister the handler and stop the accept loop.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if let Err(err) = self.transport.unhandle(PROTOCOL).await {
            warn!("direct-channel: unhandle failed: {err}");
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    #[test]
    fn varint_round_trip() {
        for n in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let encoded = encode_varint(n);
            let (decoded, consumed) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"heads").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"heads");
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn length_mismatch_is_detected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Announce 10 bytes, deliver 3.
        a.write_all(&encode_varint(10)).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        a.shutdown().await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::LengthMismatch { announced: 10, received: 3 })
        ));
    }

    #[tokio::test]
    async fn listen_delivers_messages_and_drops_short_frames() {
        let hub = MemoryHub::new();
        let a = Arc::new(MemoryTransport::new("peer-a", hub.clone()));
        let b = Arc::new(MemoryTransport::new("peer-b", hub.clone()));

        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let _listener = DirectChannel::listen(b, msg_tx).await.unwrap();

        // Malformed first: announced length bigger than the payload.
        let mut bad = a
            .dial(&"peer-b".to_string(), PROTOCOL, CancellationToken::new())
            .await
            .unwrap();
        bad.write_all(&encode_varint(99)).await.unwrap();
        bad.write_all(b"short").await.unwrap();
        bad.shutdown().await.unwrap();

        // Then a good message. Sending does not require listening.
        let channel = DirectChannel { transport: a, accept_task: Mutex::new(None) };
        channel
            .send(&"peer-b".to_string(), b"good heads", CancellationToken::new())
            .await
            .unwrap();

        let msg = msg_rx.recv().await.unwrap();
        assert_eq!(msg.remote_peer, "peer-a");
        assert_eq!(msg.bytes, b"good heads");
        // The malformed frame produced no event.
        assert!(msg_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_non_speaker_is_unsupported_protocol() {
        let hub = MemoryHub::new();
        let a = Arc::new(MemoryTransport::new("peer-a", hub.clone()));
        let _b = MemoryTransport::new("peer-b", hub.clone());

        let channel = DirectChannel { transport: a, accept_task: Mutex::new(None) };
        let err = channel
            .send(&"peer-b".to_string(), b"heads", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::UnsupportedProtocol(..))
        ));
    }

    #[tokio::test]
    async fn close_unregisters_the_handler() {
        let hub = MemoryHub::new();
        let a = Arc::new(MemoryTransport::new("peer-a", hub.clone()));
        let b = Arc::new(MemoryTransport::new("peer-b", hub.clone()));

        let (msg_tx, _msg_rx) = mpsc::channel(8);
        let listener = DirectChannel::listen(b, msg_tx).await.unwrap();
        listener.close().await.unwrap();

        let channel = DirectChannel { transport: a, accept_task: Mutex::new(None) };
        assert!(channel
            .send(&"peer-b".to_string(), b"x", CancellationToken::new())
            .await
            .is_err());
    }
}

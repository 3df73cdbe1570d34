//! The sync engine: one peer's head-exchange loop for a single log.
//!
//! The engine subscribes to the pubsub topic named by the log id, exchanges
//! heads over the direct channel when topic membership changes, and
//! broadcasts new heads on [`SyncEngine::add`]. Incoming heads are re-encoded
//! and their content addresses checked before delivery; a mismatch drops the
//! head and surfaces an error event without aborting the exchange.
//!
//! All membership and head handling runs through a concurrency-1 work queue,
//! so at most one exchange is in progress at a time and handlers run in
//! arrival order. `stop` waits for that queue to drain; it never cancels
//! in-flight work.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, ChannelMessage, DirectChannel};
use crate::entry::Entry;
use crate::marshal::{HeadsEnvelope, MarshalError, Marshaler};
use crate::oplog::Oplog;
use crate::pubsub::{PubSub, PubSubError, PubSubEvent};
use crate::transport::{PeerId, StreamTransport, TransportError};

/// Per-dial head-exchange timeout.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Errors and events ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Peer or network misbehavior, reported on the event stream and recovered
/// locally.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFault {
    /// A head's recomputed content address did not match the advertised one.
    HashMismatch { advertised: String, computed: String },
    /// Dial, stream, or publish failure for a peer.
    Transport { peer: PeerId, message: String },
    /// The per-dial timeout elapsed.
    Timeout { peer: PeerId },
    /// An envelope that could not be unmarshaled.
    BadEnvelope(String),
}

/// Events surfaced by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A head exchange with `peer` completed; `heads` is the local frontier
    /// after ingesting it.
    Join { peer: PeerId, heads: Vec<Entry> },
    /// `peer` left the topic.
    Leave { peer: PeerId },
    Error(SyncFault),
}

/// Delivery callback for verified head bytes. Invoked strictly in envelope
/// order and awaited before the next delivery; implementations must be
/// idempotent by content address, since the same head can arrive over both
/// the direct channel and the topic.
pub type OnSynced = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Per-dial head-exchange timeout.
    pub timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions { timeout: DEFAULT_EXCHANGE_TIMEOUT }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

struct Inner {
    log: Arc<dyn Oplog>,
    pubsub: Arc<dyn PubSub>,
    transport: Arc<dyn StreamTransport>,
    marshaler: Marshaler,
    on_synced: OnSynced,
    timeout: Duration,
    started: AtomicBool,
    /// Engaged peers. Mutated only by the worker task; reads copy.
    peers: std::sync::Mutex<HashSet<PeerId>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Live resources between `start` and `stop`.
struct Control {
    queue_tx: mpsc::Sender<Job>,
    router: JoinHandle<()>,
    worker: JoinHandle<()>,
    channel: Arc<DirectChannel>,
}

enum Job {
    PeerSubscribed(PeerId),
    PeerUnsubscribed(PeerId),
    /// A framed message accepted on the direct channel.
    Inbound(ChannelMessage),
    /// An envelope published on the topic.
    TopicMessage(Vec<u8>),
    /// Queue barrier used by `stop`.
    Drain(oneshot::Sender<()>),
}

pub struct SyncEngine {
    inner: Arc<Inner>,
    control: Mutex<Option<Control>>,
}

impl SyncEngine {
    pub fn new(
        log: Arc<dyn Oplog>,
        pubsub: Arc<dyn PubSub>,
        transport: Arc<dyn StreamTransport>,
        marshaler: Marshaler,
        on_synced: OnSynced,
        options: SyncOptions,
    ) -> SyncEngine {
        let (events, _) = broadcast::channel(64);
        SyncEngine {
            inner: Arc::new(Inner {
                log,
                pubsub,
                transport,
                marshaler,
                on_synced,
                timeout: options.timeout,
                started: AtomicBool::new(false),
                peers: std::sync::Mutex::new(HashSet::new()),
                events,
            }),
            control: Mutex::new(None),
        }
    }

    /// Subscribe to the log's topic, register the direct-channel handler, and
    /// start processing. Idempotent.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Ok(());
        }

        let (message_tx, message_rx) = mpsc::channel(64);
        let channel =
            Arc::new(DirectChannel::listen(self.inner.transport.clone(), message_tx).await?);
        let topic_rx = self.inner.pubsub.subscribe(self.inner.log.id()).await?;

        let (queue_tx, queue_rx) = mpsc::channel(256);
        let worker = tokio::spawn(run_worker(self.inner.clone(), channel.clone(), queue_rx));
        let router = tokio::spawn(run_router(queue_tx.clone(), topic_rx, message_rx));

        self.inner.started.store(true, Ordering::SeqCst);
        *control = Some(Control { queue_tx, router, worker, channel });
        debug!("sync: started on topic {}", self.inner.log.id());
        Ok(())
    }

    /// Drain the work queue, tear down listeners, unsubscribe, and clear the
    /// peer set. Idempotent. Does not cancel in-flight exchanges.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let mut control = self.control.lock().await;
        let Some(Control { queue_tx, router, worker, channel }) = control.take() else {
            return Ok(());
        };
        self.inner.started.store(false, Ordering::SeqCst);

        // Everything enqueued before this barrier still runs to completion.
        let (ack_tx, ack_rx) = oneshot::channel();
        if queue_tx.send(Job::Drain(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        router.abort();
        drop(queue_tx);
        let _ = worker.await;

        channel.close().await?;
        if let Err(err) = self.inner.pubsub.unsubscribe(self.inner.log.id()).await {
            warn!("sync: unsubscribe failed: {err}");
        }
        self.inner.peers.lock().expect("peer set lock").clear();
        debug!("sync: stopped");
        Ok(())
    }

    /// Broadcast a new head on the log's topic. A no-op when stopped.
    pub async fn add(&self, entry: &Entry) -> Result<(), SyncError> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let envelope = HeadsEnvelope {
            address: self.inner.log.id().to_string(),
            heads: vec![entry.clone()],
        };
        let bytes = self.inner.marshaler.marshal(&envelope)?;
        self.inner.pubsub.publish(self.inner.log.id(), bytes).await?;
        Ok(())
    }

    /// Snapshot of the currently engaged peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let peers = self.inner.peers.lock().expect("peer set lock");
        let mut out: Vec<PeerId> = peers.iter().cloned().collect();
        out.sort();
        out
    }

    /// Subscribe to join/leave/error events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}

// ─── Router: event sources → serialized queue ────────────────────────────────

async fn run_router(
    queue: mpsc::Sender<Job>,
    mut topic: mpsc::Receiver<PubSubEvent>,
    mut messages: mpsc::Receiver<ChannelMessage>,
) {
    loop {
        let job = tokio::select! {
            event = topic.recv() => match event {
                Some(PubSubEvent::Subscribed { peer }) => Job::PeerSubscribed(peer),
                Some(PubSubEvent::Unsubscribed { peer }) => Job::PeerUnsubscribed(peer),
                Some(PubSubEvent::Message { data, .. }) => Job::TopicMessage(data),
                None => break,
            },
            message = messages.recv() => match message {
                Some(message) => Job::Inbound(message),
                None => break,
            },
        };
        if queue.send(job).await.is_err() {
            break;
        }
    }
}

// ─── Worker: the concurrency-1 queue ─────────────────────────────────────────

async fn run_worker(inner: Arc<Inner>, channel: Arc<DirectChannel>, mut queue: mpsc::Receiver<Job>) {
    while let Some(job) = queue.recv().await {
        match job {
            Job::PeerSubscribed(peer) => peer_subscribed(&inner, &channel, peer).await,
            Job::PeerUnsubscribed(peer) => {
                inner.peers.lock().expect("peer set lock").remove(&peer);
                let _ = inner.events.send(SyncEvent::Leave { peer });
            }
            Job::Inbound(message) => {
                ingest_heads(&inner, Some(message.remote_peer), &message.bytes).await
            }
            Job::TopicMessage(bytes) => ingest_heads(&inner, None, &bytes).await,
            Job::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// A peer joined the topic: engage it and push our heads over the direct
/// channel. Peers that do not speak the protocol are dropped silently; any
/// other failure surfaces an error event and drops the peer.
async fn peer_subscribed(inner: &Inner, channel: &DirectChannel, peer: PeerId) {
    {
        let mut peers = inner.peers.lock().expect("peer set lock");
        if !peers.insert(peer.clone()) {
            return; // duplicate subscription event
        }
    }

    let heads = inner.log.heads().await;
    let envelope = HeadsEnvelope { address: inner.log.id().to_string(), heads };
    let bytes = match inner.marshaler.marshal(&envelope) {
        Ok(bytes) => bytes,
        Err(err) => {
            inner.peers.lock().expect("peer set lock").remove(&peer);
            let _ = inner.events.send(SyncEvent::Error(SyncFault::BadEnvelope(err.to_string())));
            return;
        }
    };

    let cancel = CancellationToken::new();
    let _release = cancel.clone().drop_guard();

    match tokio::time::timeout(inner.timeout, channel.send(&peer, &bytes, cancel.clone())).await {
        Err(_) => {
            cancel.cancel();
            inner.peers.lock().expect("peer set lock").remove(&peer);
            let _ = inner.events.send(SyncEvent::Error(SyncFault::Timeout { peer }));
        }
        Ok(Err(ChannelError::Transport(TransportError::UnsupportedProtocol(..)))) => {
            debug!("sync: {peer} does not speak the direct channel; skipping");
            inner.peers.lock().expect("peer set lock").remove(&peer);
        }
        Ok(Err(err)) => {
            inner.peers.lock().expect("peer set lock").remove(&peer);
            let _ = inner.events.send(SyncEvent::Error(SyncFault::Transport {
                peer,
                message: err.to_string(),
            }));
        }
        Ok(Ok(())) => {}
    }
}

/// Verify and deliver an envelope's heads. Both the direct-channel and the
/// topic path go through here; only the direct channel engages the peer and
/// emits `Join`.
async fn ingest_heads(inner: &Inner, from: Option<PeerId>, bytes: &[u8]) {
    if let Some(peer) = &from {
        inner.peers.lock().expect("peer set lock").insert(peer.clone());
    }

    let envelope = match inner.marshaler.unmarshal(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            let _ = inner.events.send(SyncEvent::Error(SyncFault::BadEnvelope(err.to_string())));
            return;
        }
    };

    for head in envelope.heads {
        match head.reencode() {
            Ok((computed, encoded)) if computed == head.hash => {
                (inner.on_synced)(encoded).await;
            }
            Ok((computed, _)) => {
                warn!(
                    "sync: dropping head {} (content re-encodes to {computed})",
                    head.hash
                );
                let _ = inner.events.send(SyncEvent::Error(SyncFault::HashMismatch {
                    advertised: head.hash.clone(),
                    computed,
                }));
            }
            Err(err) => {
                let _ = inner.events.send(SyncEvent::Error(SyncFault::BadEnvelope(err.to_string())));
            }
        }
    }

    if let Some(peer) = from {
        if inner.started.load(Ordering::SeqCst) {
            let heads = inner.log.heads().await;
            let _ = inner.events.send(SyncEvent::Join { peer, heads });
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

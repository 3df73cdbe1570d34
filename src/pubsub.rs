//! The publish/subscribe capability the sync engine consumes, plus an
//! in-process topic mesh used by tests and demos.
//!
//! A topic delivers two kinds of events: messages published by other
//! subscribers, and membership changes (a peer subscribed or unsubscribed).
//! Joining a topic also replays the current membership as `Subscribed`
//! events so a late joiner learns who is already there.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::transport::PeerId;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("not subscribed to {0}")]
    NotSubscribed(String),
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Events delivered to a topic subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubEvent {
    /// A message published on the topic by another peer.
    Message { from: PeerId, data: Vec<u8> },
    /// A peer subscribed to the topic.
    Subscribed { peer: PeerId },
    /// A peer unsubscribed from the topic.
    Unsubscribed { peer: PeerId },
}

/// Topic-based publish/subscribe. Message boundaries are preserved; delivery
/// is best-effort (messages may be lost, duplicated, or reordered by real
/// transports).
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Join `topic`; events arrive on the returned receiver until
    /// [`PubSub::unsubscribe`].
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubEvent>, PubSubError>;

    /// Leave `topic`, notifying remaining subscribers.
    async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError>;

    /// Publish raw bytes to every other subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

const TOPIC_BUFFER: usize = 64;

/// Shared topic membership for a set of in-process peers.
#[derive(Default)]
pub struct MemoryMesh {
    topics: Mutex<HashMap<String, HashMap<PeerId, mpsc::Sender<PubSubEvent>>>>,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A single peer's endpoint on a [`MemoryMesh`].
pub struct MemoryPubSub {
    local_peer: PeerId,
    mesh: Arc<MemoryMesh>,
}

impl MemoryPubSub {
    pub fn new(local_peer: impl Into<PeerId>, mesh: Arc<MemoryMesh>) -> Self {
        MemoryPubSub { local_peer: local_peer.into(), mesh }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubEvent>, PubSubError> {
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);

        let mut topics = self.mesh.topics.lock().await;
        let members = topics.entry(topic.to_string()).or_default();
        if members.contains_key(&self.local_peer) {
            return Err(PubSubError::AlreadySubscribed(topic.to_string()));
        }

        // Tell existing members about us, and replay them to us.
        let mut notifications = Vec::new();
        for (peer, sender) in members.iter() {
            notifications.push(sender.send(PubSubEvent::Subscribed {
                peer: self.local_peer.clone(),
            }));
            let _ = tx.send(PubSubEvent::Subscribed { peer: peer.clone() }).await;
        }
        join_all(notifications).await;

        members.insert(self.local_peer.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        let mut topics = self.mesh.topics.lock().await;
        let members = topics
            .get_mut(topic)
            .ok_or_else(|| PubSubError::NotSubscribed(topic.to_string()))?;
        if members.remove(&self.local_peer).is_none() {
            return Err(PubSubError::NotSubscribed(topic.to_string()));
        }

        let notifications: Vec<_> = members
            .values()
            .map(|sender| {
                sender.send(PubSubEvent::Unsubscribed { peer: self.local_peer.clone() })
            })
            .collect();
        join_all(notifications).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let senders: Vec<_> = {
            let topics = self.mesh.topics.lock().await;
            let members = match topics.get(topic) {
                Some(m) => m,
                None => return Ok(()), // nobody listening; delivery is best-effort
            };
            members
                .iter()
                .filter(|(peer, _)| **peer != self.local_peer)
                .map(|(_, sender)| sender.clone())
                .collect()
        };

        let from = self.local_peer.clone();
        join_all(senders.iter().map(|sender| {
            sender.send(PubSubEvent::Message { from: from.clone(), data: data.clone() })
        }))
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_joiner_sees_existing_members() {
        let mesh = MemoryMesh::new();
        let a = MemoryPubSub::new("peer-a", mesh.clone());
        let b = MemoryPubSub::new("peer-b", mesh.clone());

        let mut a_rx = a.subscribe("topic").await.unwrap();
        let mut b_rx = b.subscribe("topic").await.unwrap();

        assert_eq!(
            a_rx.recv().await,
            Some(PubSubEvent::Subscribed { peer: "peer-b".into() })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(PubSubEvent::Subscribed { peer: "peer-a".into() })
        );
    }

    #[tokio::test]
    async fn publish_reaches_other_subscribers_only() {
        let mesh = MemoryMesh::new();
        let a = MemoryPubSub::new("peer-a", mesh.clone());
        let b = MemoryPubSub::new("peer-b", mesh.clone());

        let mut a_rx = a.subscribe("topic").await.unwrap();
        let mut b_rx = b.subscribe("topic").await.unwrap();
        let _ = a_rx.recv().await; // membership event
        let _ = b_rx.recv().await;

        a.publish("topic", b"update".to_vec()).await.unwrap();

        assert_eq!(
            b_rx.recv().await,
            Some(PubSubEvent::Message { from: "peer-a".into(), data: b"update".to_vec() })
        );
        assert!(a_rx.try_recv().is_err()); // no self-delivery
    }

    #[tokio::test]
    async fn unsubscribe_notifies_remaining_members() {
        let mesh = MemoryMesh::new();
        let a = MemoryPubSub::new("peer-a", mesh.clone());
        let b = MemoryPubSub::new("peer-b", mesh.clone());

        let mut a_rx = a.subscribe("topic").await.unwrap();
        let _b_rx = b.subscribe("topic").await.unwrap();
        let _ = a_rx.recv().await;

        b.unsubscribe("topic").await.unwrap();
        assert_eq!(
            a_rx.recv().await,
            Some(PubSubEvent::Unsubscribed { peer: "peer-b".into() })
        );
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let mesh = MemoryMesh::new();
        let a = MemoryPubSub::new("peer-a", mesh);
        let _rx = a.subscribe("topic").await.unwrap();
        assert!(matches!(
            a.subscribe("topic").await,
            Err(PubSubError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn publish_to_empty_topic_is_a_noop() {
        let mesh = MemoryMesh::new();
        let a = MemoryPubSub::new("peer-a", mesh);
        a.publish("nowhere", b"x".to_vec()).await.unwrap();
    }
}

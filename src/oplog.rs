//! The log contract the sync engine consumes, plus an in-memory log used by
//! tests and demos.
//!
//! The engine only ever needs the log's identifier (which doubles as the
//! pubsub topic) and its current heads, the frontier entries with no known
//! successor. Filling interior gaps is the log consumer's job, not the
//! engine's.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::canonical::{cid_to_base32, cid_to_base58};
use crate::entry::Entry;

/// What the sync engine needs from a log.
#[async_trait]
pub trait Oplog: Send + Sync {
    /// The log identifier; also the pubsub topic name.
    fn id(&self) -> &str;

    /// The current frontier, in insertion order.
    async fn heads(&self) -> Vec<Entry>;
}

/// A minimal append-only in-memory log tracking heads by content address.
pub struct MemoryLog {
    id: String,
    heads: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryLog {
    pub fn new(id: impl Into<String>) -> Self {
        MemoryLog { id: id.into(), heads: RwLock::new(BTreeMap::new()) }
    }

    /// Add an entry to the log. Entries named in the newcomer's `next` stop
    /// being heads; re-adding a known head is a no-op.
    pub async fn append(&self, entry: Entry) {
        let mut heads = self.heads.write().await;
        for cid in &entry.next {
            let b58 = cid_to_base58(cid).ok();
            let b32 = cid_to_base32(cid).ok();
            heads.retain(|hash, _| Some(hash) != b58.as_ref() && Some(hash) != b32.as_ref());
        }
        heads.entry(entry.hash.clone()).or_insert(entry);
    }

    /// True if `hash` is currently a head.
    pub async fn has_head(&self, hash: &str) -> bool {
        self.heads.read().await.contains_key(hash)
    }
}

#[async_trait]
impl Oplog for MemoryLog {
    fn id(&self) -> &str {
        &self.id
    }

    async fn heads(&self) -> Vec<Entry> {
        self.heads.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Dialect;
    use crate::identity::{Identities, Identity};
    use crate::keys::generate_keypair;
    use cid::Cid;
    use ipld_core::ipld::Ipld;

    fn fixture() -> (Identities, Identity) {
        let mut identities = Identities::new();
        let identity = identities.create_identity(&generate_keypair()).unwrap();
        (identities, identity)
    }

    #[tokio::test]
    async fn append_tracks_the_frontier() {
        let (identities, identity) = fixture();
        let log = MemoryLog::new("log");

        let root = Entry::create(
            &identities, &identity, "log", Ipld::String("root".into()),
            None, vec![], vec![], Dialect::V2,
        )
        .unwrap();
        log.append(root.clone()).await;
        assert_eq!(log.heads().await.len(), 1);

        let child = Entry::create(
            &identities, &identity, "log", Ipld::String("child".into()),
            None, vec![Cid::try_from(root.hash.as_str()).unwrap()], vec![], Dialect::V2,
        )
        .unwrap();
        log.append(child.clone()).await;

        let heads = log.heads().await;
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].hash, child.hash);
        assert!(log.has_head(&child.hash).await);
        assert!(!log.has_head(&root.hash).await);
    }

    #[tokio::test]
    async fn duplicate_append_is_idempotent() {
        let (identities, identity) = fixture();
        let log = MemoryLog::new("log");

        let entry = Entry::create(
            &identities, &identity, "log", Ipld::String("once".into()),
            None, vec![], vec![], Dialect::V2,
        )
        .unwrap();
        log.append(entry.clone()).await;
        log.append(entry).await;
        assert_eq!(log.heads().await.len(), 1);
    }
}

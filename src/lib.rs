//! Peer-to-peer, content-addressed, eventually-consistent operation-log
//! synchronization, wire-compatible with both orbit-db dialects.
//!
//! A peer mutates its local append-only log and hands new entries to the
//! [`sync::SyncEngine`], which broadcasts the log's heads on a pubsub topic
//! and exchanges them over a direct stream protocol when peers join. Remote
//! peers verify each head's content address before delivering it; trust is
//! rooted in entry signatures, never in the transport.
//!
//! Entries exist in two dialects: the current dag-cbor form with base58btc
//! content addresses ([`entry::Dialect::V2`]) and the legacy canonical-JSON
//! form with inline identities and base32 addresses ([`entry::Dialect::V1`]).
//! Conversion between them is lossless for the signed fields.

pub mod address;
pub mod canonical;
pub mod channel;
pub mod entry;
pub mod identity;
pub mod keys;
pub mod manifest;
pub mod marshal;
pub mod oplog;
pub mod pubsub;
pub mod sync;
pub mod transport;

// ── Entry format ──────────────────────────────────────────────────────────────
pub use entry::{is_entry, is_equal, Dialect, Entry, EntryError, EntryV1, LamportClock};
pub use identity::{Identities, Identity, IdentityDocument, IdentityError};
pub use keys::{generate_keypair, import_from_hex, KeyError, KeyPair};

// ── Addresses and manifests ───────────────────────────────────────────────────
pub use address::{Address, AddressError};
pub use manifest::{Manifest, ManifestBlock, ManifestError};

// ── Wire plumbing ─────────────────────────────────────────────────────────────
pub use channel::{ChannelError, ChannelMessage, DirectChannel, PROTOCOL as DIRECT_CHANNEL_PROTOCOL};
pub use marshal::{HeadsEnvelope, MarshalError, Marshaler};
pub use pubsub::{MemoryMesh, MemoryPubSub, PubSub, PubSubError, PubSubEvent};
pub use transport::{MemoryHub, MemoryTransport, PeerId, StreamTransport, TransportError};

// ── Sync engine ───────────────────────────────────────────────────────────────
pub use oplog::{MemoryLog, Oplog};
pub use sync::{OnSynced, SyncEngine, SyncError, SyncEvent, SyncFault, SyncOptions};

//! Log entries: construction, signing, content addressing, verification, and
//! the two wire dialects.
//!
//! An entry is one immutable operation in a log. The signed fields are
//! `{id, payload, next, refs, clock, v}`; the full document adds the author
//! key, an identity reference, and the signature, and is content-addressed
//! under the IPLD dag-cbor codec with sha2-256.
//!
//! The current dialect (`v2`) signs the dag-cbor image of the signed fields
//! and renders its hash base58btc. The legacy dialect (`v1`) signs canonical
//! JSON (with a `hash: null` quirk and base64-rewritten operation payloads),
//! inlines the identity document, and renders its hash base32. A legacy entry
//! decoded from the wire is projected to the in-memory shape and keeps its
//! original wire form attached, because the legacy signing image is not recoverable
//! from the projected fields alone.

use cid::Cid;
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::canonical::{
    cid_to_base32, cid_to_base58, content_cid, ipld_to_legacy_json, json_to_ipld, revive_string,
    to_canonical_json,
};
use crate::identity::{Identities, Identity, IdentityDocument, IdentityError};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EntryError {
    /// Missing or malformed caller input. Programmer error; never swallowed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Structural check failed: a required signed field is absent or has the
    /// wrong shape.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

// ─── Dialect and clock ───────────────────────────────────────────────────────

/// The wire format variant an entry was created or decoded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Legacy JSON dialect: canonical-JSON signing image, inline identity,
    /// base32 hash.
    V1,
    /// Current dialect: dag-cbor signing image, identity by reference,
    /// base58btc hash.
    V2,
}

impl Dialect {
    /// The `v` marker carried in the signed fields.
    pub fn version(self) -> u64 {
        match self {
            Dialect::V1 => 1,
            Dialect::V2 => 2,
        }
    }
}

/// Lamport-style logical clock. `id` is the author's public key; time
/// monotonicity within a log is the log's responsibility, not the entry's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    pub id: String,
    pub time: u64,
}

impl LamportClock {
    pub fn new(id: impl Into<String>) -> Self {
        LamportClock { id: id.into(), time: 0 }
    }

    pub fn with_time(id: impl Into<String>, time: u64) -> Self {
        LamportClock { id: id.into(), time }
    }
}

// ─── Wire documents ──────────────────────────────────────────────────────────

/// The signed fields, in their current-dialect byte image order.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a str,
    payload: &'a Ipld,
    next: &'a [Cid],
    refs: &'a [Cid],
    clock: &'a LamportClock,
    v: u64,
}

/// The full current-dialect document as content-addressed on the wire.
#[derive(Serialize, Deserialize)]
struct DocumentV2 {
    id: String,
    payload: Ipld,
    next: Vec<Cid>,
    refs: Vec<Cid>,
    clock: LamportClock,
    v: u64,
    key: String,
    identity: String,
    sig: String,
}

/// The full legacy wire document. Field types mirror the JSON wire form:
/// hex strings for byte-valued fields, base58 strings for links, the payload
/// as a UTF-8 string, and the identity document inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryV1 {
    /// `null` in the signed image and the content-addressed document; the
    /// advertised base32 hash when carried inside a heads envelope.
    #[serde(default)]
    pub hash: Option<String>,
    pub id: String,
    pub payload: String,
    pub next: Vec<String>,
    pub refs: Vec<String>,
    pub clock: LamportClock,
    pub v: u64,
    pub key: String,
    pub identity: IdentityDocument,
    pub sig: String,
    /// Placeholder carried by some legacy writers; included in the signed
    /// image when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
}

/// A current-dialect entry as carried inside a heads envelope: the full
/// document plus the advertised content address.
#[derive(Serialize, Deserialize)]
pub(crate) struct EnvelopeEntryV2 {
    id: String,
    payload: Ipld,
    next: Vec<Cid>,
    refs: Vec<Cid>,
    clock: LamportClock,
    v: u64,
    key: String,
    identity: String,
    sig: String,
    hash: String,
}

// ─── Entry ───────────────────────────────────────────────────────────────────

/// A complete, signed, content-addressed log entry.
///
/// Always fully populated: `create` and `decode` never return a partially
/// constructed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: String,
    pub payload: Ipld,
    pub next: Vec<Cid>,
    pub refs: Vec<Cid>,
    pub clock: LamportClock,
    pub v: u64,
    /// Author public key, hex.
    pub key: String,
    /// Content address of the identity document (base58btc).
    pub identity: String,
    /// Signature over the dialect's signing image, hex.
    pub sig: String,
    /// Content address of the full document, in the dialect's multibase.
    pub hash: String,
    /// The dag-cbor document bytes behind `hash`.
    pub bytes: Vec<u8>,
    pub dialect: Dialect,
    /// Original legacy wire form, preserved for re-verification. Present on
    /// every legacy-dialect entry.
    pub legacy: Option<EntryV1>,
}

impl Entry {
    /// Construct, sign, and encode a new entry.
    ///
    /// * `clock` — defaults to `{id: author key, time: 0}` when omitted.
    /// * `next` / `refs` — direct predecessors and skip-list ancestors; empty
    ///   for a root entry.
    pub fn create(
        identities: &Identities,
        identity: &Identity,
        log_id: &str,
        payload: Ipld,
        clock: Option<LamportClock>,
        next: Vec<Cid>,
        refs: Vec<Cid>,
        dialect: Dialect,
    ) -> Result<Entry, EntryError> {
        if log_id.is_empty() {
            return Err(EntryError::InvalidArgument("entry requires an id".into()));
        }
        if matches!(payload, Ipld::Null) {
            return Err(EntryError::InvalidArgument("entry requires a payload".into()));
        }

        let clock = clock.unwrap_or_else(|| LamportClock::new(identity.public_key()));

        match dialect {
            Dialect::V2 => Self::create_v2(identities, identity, log_id, payload, clock, next, refs),
            Dialect::V1 => Self::create_v1(identities, identity, log_id, payload, clock, next, refs),
        }
    }

    fn create_v2(
        identities: &Identities,
        identity: &Identity,
        log_id: &str,
        payload: Ipld,
        clock: LamportClock,
        next: Vec<Cid>,
        refs: Vec<Cid>,
    ) -> Result<Entry, EntryError> {
        let image = signing_image_v2(log_id, &payload, &next, &refs, &clock)?;
        let sig = identities.sign(identity, &image)?;

        let document = DocumentV2 {
            id: log_id.to_string(),
            payload,
            next,
            refs,
            clock,
            v: 2,
            key: identity.public_key().to_string(),
            identity: identity.hash.clone(),
            sig,
        };
        let bytes =
            serde_ipld_dagcbor::to_vec(&document).map_err(|e| EntryError::Encode(e.to_string()))?;
        let hash = cid_to_base58(&content_cid(&bytes)).map_err(|e| EntryError::Encode(e.to_string()))?;

        Ok(Entry {
            id: document.id,
            payload: document.payload,
            next: document.next,
            refs: document.refs,
            clock: document.clock,
            v: 2,
            key: document.key,
            identity: document.identity,
            sig: document.sig,
            hash,
            bytes,
            dialect: Dialect::V2,
            legacy: None,
        })
    }

    fn create_v1(
        identities: &Identities,
        identity: &Identity,
        log_id: &str,
        payload: Ipld,
        clock: LamportClock,
        next: Vec<Cid>,
        refs: Vec<Cid>,
    ) -> Result<Entry, EntryError> {
        let next_str = cids_to_base58(&next)?;
        let refs_str = cids_to_base58(&refs)?;
        let payload_str = legacy_payload_string(&payload)?;

        let mut wire = EntryV1 {
            hash: None,
            id: log_id.to_string(),
            payload: payload_str,
            next: next_str,
            refs: refs_str,
            clock,
            v: 1,
            key: identity.public_key().to_string(),
            identity: identity.document.clone(),
            sig: String::new(),
            additional_data: None,
        };

        let image = legacy_signing_image(&wire);
        wire.sig = identities.sign(identity, image.as_bytes())?;

        let bytes =
            serde_ipld_dagcbor::to_vec(&wire).map_err(|e| EntryError::Encode(e.to_string()))?;
        let hash = cid_to_base32(&content_cid(&bytes)).map_err(|e| EntryError::Encode(e.to_string()))?;
        wire.hash = Some(hash.clone());

        Self::project_legacy(wire, hash, bytes)
    }

    /// Project a legacy wire document to the in-memory shape, keeping the
    /// wire form attached. An advertised `hash` is kept as-is for later
    /// comparison against [`Entry::reencode`]; absent one, the computed
    /// address is used.
    pub fn from_legacy(wire: EntryV1) -> Result<Entry, EntryError> {
        let mut addressed = wire.clone();
        addressed.hash = None;
        let bytes =
            serde_ipld_dagcbor::to_vec(&addressed).map_err(|e| EntryError::Encode(e.to_string()))?;
        let computed =
            cid_to_base32(&content_cid(&bytes)).map_err(|e| EntryError::Encode(e.to_string()))?;
        let hash = wire.hash.clone().unwrap_or(computed);
        Self::project_legacy(wire, hash, bytes)
    }

    pub(crate) fn to_envelope_v2(&self) -> EnvelopeEntryV2 {
        EnvelopeEntryV2 {
            id: self.id.clone(),
            payload: self.payload.clone(),
            next: self.next.clone(),
            refs: self.refs.clone(),
            clock: self.clock.clone(),
            v: self.v,
            key: self.key.clone(),
            identity: self.identity.clone(),
            sig: self.sig.clone(),
            hash: self.hash.clone(),
        }
    }

    /// Rebuild an entry from its envelope form. The advertised hash is kept
    /// verbatim; `bytes` holds the re-encoded document so receivers can
    /// detect a hash/content mismatch via [`Entry::reencode`].
    pub(crate) fn from_envelope_v2(envelope: EnvelopeEntryV2) -> Result<Entry, EntryError> {
        let document = DocumentV2 {
            id: envelope.id,
            payload: envelope.payload,
            next: envelope.next,
            refs: envelope.refs,
            clock: envelope.clock,
            v: envelope.v,
            key: envelope.key,
            identity: envelope.identity,
            sig: envelope.sig,
        };
        let bytes =
            serde_ipld_dagcbor::to_vec(&document).map_err(|e| EntryError::Encode(e.to_string()))?;
        Ok(Entry {
            id: document.id,
            payload: document.payload,
            next: document.next,
            refs: document.refs,
            clock: document.clock,
            v: document.v,
            key: document.key,
            identity: document.identity,
            sig: document.sig,
            hash: envelope.hash,
            bytes,
            dialect: Dialect::V2,
            legacy: None,
        })
    }

    fn project_legacy(wire: EntryV1, hash: String, bytes: Vec<u8>) -> Result<Entry, EntryError> {
        let identity = Identity::from_document(wire.identity.clone())?;
        Ok(Entry {
            id: wire.id.clone(),
            payload: revive_legacy_payload(&wire.payload),
            next: base58_to_cids(&wire.next)?,
            refs: base58_to_cids(&wire.refs)?,
            clock: wire.clock.clone(),
            v: 1,
            key: wire.key.clone(),
            identity: identity.hash,
            sig: wire.sig.clone(),
            hash,
            bytes,
            dialect: Dialect::V1,
            legacy: Some(wire),
        })
    }

    /// Decode an entry from its content-addressed document bytes. The dialect
    /// is inferred from the decoded shape: a string `identity` field is the
    /// current dialect, an inline identity document is legacy.
    pub fn decode(bytes: &[u8]) -> Result<Entry, EntryError> {
        let probe: Ipld =
            serde_ipld_dagcbor::from_slice(bytes).map_err(|e| EntryError::Decode(e.to_string()))?;
        let map = match &probe {
            Ipld::Map(map) => map,
            _ => return Err(EntryError::Decode("entry document is not a map".into())),
        };

        match map.get("identity") {
            Some(Ipld::String(_)) => {
                let doc: DocumentV2 = serde_ipld_dagcbor::from_slice(bytes)
                    .map_err(|e| EntryError::Decode(e.to_string()))?;
                let hash = cid_to_base58(&content_cid(bytes))
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                Ok(Entry {
                    id: doc.id,
                    payload: doc.payload,
                    next: doc.next,
                    refs: doc.refs,
                    clock: doc.clock,
                    v: doc.v,
                    key: doc.key,
                    identity: doc.identity,
                    sig: doc.sig,
                    hash,
                    bytes: bytes.to_vec(),
                    dialect: Dialect::V2,
                    legacy: None,
                })
            }
            Some(Ipld::Map(_)) => {
                let wire: EntryV1 = serde_ipld_dagcbor::from_slice(bytes)
                    .map_err(|e| EntryError::Decode(e.to_string()))?;
                let hash = cid_to_base32(&content_cid(bytes))
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                Self::project_legacy(wire, hash, bytes.to_vec())
            }
            _ => Err(EntryError::Decode("entry document has no identity field".into())),
        }
    }

    /// Rebuild the content-addressed document from the entry's fields and
    /// return `(hash, bytes)`. Receivers compare the result against the
    /// advertised `hash`; a mismatch is a protocol error.
    pub fn reencode(&self) -> Result<(String, Vec<u8>), EntryError> {
        match self.dialect {
            Dialect::V2 => {
                let document = DocumentV2 {
                    id: self.id.clone(),
                    payload: self.payload.clone(),
                    next: self.next.clone(),
                    refs: self.refs.clone(),
                    clock: self.clock.clone(),
                    v: self.v,
                    key: self.key.clone(),
                    identity: self.identity.clone(),
                    sig: self.sig.clone(),
                };
                let bytes = serde_ipld_dagcbor::to_vec(&document)
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                let hash = cid_to_base58(&content_cid(&bytes))
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                Ok((hash, bytes))
            }
            Dialect::V1 => {
                let wire = self.legacy.as_ref().ok_or_else(|| {
                    EntryError::InvalidEntry("legacy entry is missing its wire form".into())
                })?;
                let mut addressed = wire.clone();
                addressed.hash = None;
                let bytes = serde_ipld_dagcbor::to_vec(&addressed)
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                let hash = cid_to_base32(&content_cid(&bytes))
                    .map_err(|e| EntryError::Encode(e.to_string()))?;
                Ok((hash, bytes))
            }
        }
    }

    /// Verify the entry's signature over its dialect's signing image.
    ///
    /// Structural failures are errors; a failed signature check returns
    /// `Ok(false)`. The image is always recomputed, never read from a cache.
    pub fn verify(&self, identities: &Identities) -> Result<bool, EntryError> {
        if self.id.is_empty() {
            return Err(EntryError::InvalidEntry("missing id".into()));
        }
        if self.key.is_empty() {
            return Err(EntryError::InvalidEntry("missing key".into()));
        }
        if self.sig.is_empty() {
            return Err(EntryError::InvalidEntry("missing sig".into()));
        }
        if self.clock.id.is_empty() {
            return Err(EntryError::InvalidEntry("missing clock".into()));
        }
        if self.v != self.dialect.version() {
            return Err(EntryError::InvalidEntry(format!("unexpected version {}", self.v)));
        }

        let image = match self.dialect {
            Dialect::V2 => {
                signing_image_v2(&self.id, &self.payload, &self.next, &self.refs, &self.clock)?
            }
            Dialect::V1 => {
                let wire = self.legacy.as_ref().ok_or_else(|| {
                    EntryError::InvalidEntry("legacy entry is missing its wire form".into())
                })?;
                legacy_signing_image(wire).into_bytes()
            }
        };

        Ok(identities.verify_sig(&self.sig, &self.key, &image)?)
    }
}

/// Structural predicate over a decoded document value.
pub fn is_entry(value: &Ipld) -> bool {
    let map = match value {
        Ipld::Map(map) => map,
        _ => return false,
    };
    ["id", "payload", "next", "refs", "clock", "v", "key", "sig"]
        .iter()
        .all(|field| map.contains_key(*field))
}

/// Two entries are the same entry iff their content addresses agree.
pub fn is_equal(a: &Entry, b: &Entry) -> bool {
    a.hash == b.hash
}

// ─── Signing images ──────────────────────────────────────────────────────────

fn signing_image_v2(
    id: &str,
    payload: &Ipld,
    next: &[Cid],
    refs: &[Cid],
    clock: &LamportClock,
) -> Result<Vec<u8>, EntryError> {
    let fields = SignedFields { id, payload, next, refs, clock, v: 2 };
    serde_ipld_dagcbor::to_vec(&fields).map_err(|e| EntryError::Encode(e.to_string()))
}

/// Canonical JSON over the legacy signed fields, `hash: null` included.
fn legacy_signing_image(wire: &EntryV1) -> String {
    let mut image = serde_json::Map::new();
    if let Some(additional) = &wire.additional_data {
        image.insert("additional_data".into(), additional.clone());
    }
    image.insert("clock".into(), json!({"id": wire.clock.id, "time": wire.clock.time}));
    image.insert("hash".into(), Value::Null);
    image.insert("id".into(), Value::String(wire.id.clone()));
    image.insert(
        "next".into(),
        Value::Array(wire.next.iter().cloned().map(Value::String).collect()),
    );
    image.insert("payload".into(), Value::String(wire.payload.clone()));
    image.insert(
        "refs".into(),
        Value::Array(wire.refs.iter().cloned().map(Value::String).collect()),
    );
    image.insert("v".into(), Value::Number(1.into()));
    to_canonical_json(&Value::Object(image))
}

// ─── Legacy payload rules ────────────────────────────────────────────────────

/// Render a payload for the legacy wire: a string payload travels verbatim,
/// anything else as canonical JSON with bytes base64-encoded and links in
/// multibase form.
fn legacy_payload_string(payload: &Ipld) -> Result<String, EntryError> {
    if let Ipld::String(s) = payload {
        return Ok(s.clone());
    }
    let json = ipld_to_legacy_json(payload).map_err(|e| EntryError::Encode(e.to_string()))?;
    Ok(to_canonical_json(&json))
}

/// Reconstitute a legacy payload string. Schema-directed: only an operation
/// record's `value` field is subject to the base64 rule; every other string
/// stays a string.
fn revive_legacy_payload(payload: &str) -> Ipld {
    let parsed: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Ipld::String(payload.to_string()),
    };
    let map = match parsed {
        Value::Object(map) => map,
        other => return json_to_ipld(&other),
    };
    if !map.contains_key("op") {
        return json_to_ipld(&Value::Object(map));
    }

    let mut out = std::collections::BTreeMap::new();
    for (k, v) in &map {
        let revived = match (k.as_str(), v) {
            ("value", Value::String(s)) => revive_string(s),
            _ => json_to_ipld(v),
        };
        out.insert(k.clone(), revived);
    }
    Ipld::Map(out)
}

fn cids_to_base58(cids: &[Cid]) -> Result<Vec<String>, EntryError> {
    cids.iter()
        .map(|cid| cid_to_base58(cid).map_err(|e| EntryError::Encode(e.to_string())))
        .collect()
}

fn base58_to_cids(strings: &[String]) -> Result<Vec<Cid>, EntryError> {
    strings
        .iter()
        .map(|s| Cid::try_from(s.as_str()).map_err(|e| EntryError::Decode(e.to_string())))
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

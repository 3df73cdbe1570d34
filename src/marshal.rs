//! Dialect-aware (de)serialization for sync envelopes.
//!
//! A heads envelope is `{address, heads}`. The current dialect carries the
//! in-memory record through the IPLD codec unchanged; the legacy dialect is
//! canonical JSON with the legacy entry wire forms. Decoding is
//! schema-directed, so the legacy reviver's base64 ambiguity never reaches
//! the identity or address fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::to_canonical_json;
use crate::entry::{Dialect, Entry, EntryError, EntryV1};

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Entry(#[from] EntryError),
}

/// The sync message exchanged between peers: a log address and its current
/// frontier entries.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadsEnvelope {
    pub address: String,
    pub heads: Vec<Entry>,
}

#[derive(Serialize, Deserialize)]
struct WireV2 {
    address: String,
    heads: Vec<crate::entry::EnvelopeEntryV2>,
}

#[derive(Serialize, Deserialize)]
struct WireV1 {
    address: String,
    heads: Vec<EntryV1>,
}

/// Envelope codec for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct Marshaler {
    dialect: Dialect,
}

impl Marshaler {
    pub fn new(dialect: Dialect) -> Self {
        Marshaler { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Serialize an envelope to its wire bytes.
    pub fn marshal(&self, envelope: &HeadsEnvelope) -> Result<Vec<u8>, MarshalError> {
        match self.dialect {
            Dialect::V2 => {
                let wire = WireV2 {
                    address: envelope.address.clone(),
                    heads: envelope.heads.iter().map(Entry::to_envelope_v2).collect(),
                };
                serde_ipld_dagcbor::to_vec(&wire).map_err(|e| MarshalError::Encode(e.to_string()))
            }
            Dialect::V1 => {
                let heads = envelope
                    .heads
                    .iter()
                    .map(|entry| {
                        entry.legacy.clone().ok_or_else(|| {
                            MarshalError::InvalidArgument(
                                "entry has no legacy wire form".into(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let wire = WireV1 { address: envelope.address.clone(), heads };
                let value =
                    serde_json::to_value(&wire).map_err(|e| MarshalError::Encode(e.to_string()))?;
                Ok(to_canonical_json(&value).into_bytes())
            }
        }
    }

    /// Parse wire bytes back into an envelope.
    pub fn unmarshal(&self, bytes: &[u8]) -> Result<HeadsEnvelope, MarshalError> {
        match self.dialect {
            Dialect::V2 => {
                let wire: WireV2 = serde_ipld_dagcbor::from_slice(bytes)
                    .map_err(|e| MarshalError::Decode(e.to_string()))?;
                let heads = wire
                    .heads
                    .into_iter()
                    .map(Entry::from_envelope_v2)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(HeadsEnvelope { address: wire.address, heads })
            }
            Dialect::V1 => {
                let wire: WireV1 = serde_json::from_slice(bytes)
                    .map_err(|e| MarshalError::Decode(e.to_string()))?;
                let heads = wire
                    .heads
                    .into_iter()
                    .map(Entry::from_legacy)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(HeadsEnvelope { address: wire.address, heads })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LamportClock;
    use crate::identity::{Identities, Identity};
    use crate::keys::generate_keypair;
    use ipld_core::ipld::Ipld;

    fn fixture() -> (Identities, Identity) {
        let mut identities = Identities::new();
        let identity = identities.create_identity(&generate_keypair()).unwrap();
        (identities, identity)
    }

    fn entry(identities: &Identities, identity: &Identity, dialect: Dialect) -> Entry {
        Entry::create(
            identities,
            identity,
            "/orbitdb/log",
            Ipld::String("head".into()),
            Some(LamportClock::with_time(identity.public_key(), 3)),
            vec![],
            vec![],
            dialect,
        )
        .unwrap()
    }

    #[test]
    fn v2_round_trip() {
        let (identities, identity) = fixture();
        let head = entry(&identities, &identity, Dialect::V2);
        let marshaler = Marshaler::new(Dialect::V2);

        let envelope = HeadsEnvelope { address: "/orbitdb/log".into(), heads: vec![head.clone()] };
        let bytes = marshaler.marshal(&envelope).unwrap();
        let back = marshaler.unmarshal(&bytes).unwrap();

        assert_eq!(back.address, envelope.address);
        assert_eq!(back.heads.len(), 1);
        assert_eq!(back.heads[0].hash, head.hash);
        assert_eq!(back.heads[0].payload, head.payload);
        assert!(back.heads[0].verify(&identities).unwrap());
    }

    #[test]
    fn v1_round_trip_is_canonical_json() {
        let (identities, identity) = fixture();
        let head = entry(&identities, &identity, Dialect::V1);
        let marshaler = Marshaler::new(Dialect::V1);

        let envelope = HeadsEnvelope { address: "/orbitdb/log".into(), heads: vec![head.clone()] };
        let bytes = marshaler.marshal(&envelope).unwrap();

        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with(r#"{"address":"/orbitdb/log","heads":["#));
        assert!(!text.contains(' '));

        let back = marshaler.unmarshal(&bytes).unwrap();
        assert_eq!(back.heads[0].hash, head.hash);
        assert!(back.heads[0].verify(&identities).unwrap());
    }

    #[test]
    fn v1_marshal_requires_legacy_wire_form() {
        let (identities, identity) = fixture();
        let head = entry(&identities, &identity, Dialect::V2);
        let marshaler = Marshaler::new(Dialect::V1);

        let envelope = HeadsEnvelope { address: "/orbitdb/log".into(), heads: vec![head] };
        assert!(matches!(
            marshaler.marshal(&envelope),
            Err(MarshalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn legacy_capture_with_operation_payload() {
        // A heads envelope as a legacy peer would emit it, with an operation
        // record payload whose value is base64.
        let (identities, identity) = fixture();
        let payload = Ipld::Map(
            [
                ("op".to_string(), Ipld::String("PUT".into())),
                ("key".to_string(), Ipld::String("k".into())),
                ("value".to_string(), Ipld::Bytes(b"hello".to_vec())),
            ]
            .into(),
        );
        let head = Entry::create(
            &identities,
            &identity,
            "/orbitdb/log",
            payload,
            None,
            vec![],
            vec![],
            Dialect::V1,
        )
        .unwrap();
        let marshaler = Marshaler::new(Dialect::V1);
        let bytes = marshaler
            .marshal(&HeadsEnvelope { address: "/orbitdb/log".into(), heads: vec![head] })
            .unwrap();

        let back = marshaler.unmarshal(&bytes).unwrap();
        let entry = &back.heads[0];
        match &entry.payload {
            Ipld::Map(map) => {
                assert_eq!(map.get("value"), Some(&Ipld::Bytes(b"hello".to_vec())));
                assert_eq!(map.get("op"), Some(&Ipld::String("PUT".into())));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(entry.verify(&identities).unwrap());
    }

    #[test]
    fn garbage_bytes_fail_cleanly() {
        for dialect in [Dialect::V1, Dialect::V2] {
            let marshaler = Marshaler::new(dialect);
            assert!(marshaler.unmarshal(b"\xff\x00 not an envelope").is_err());
        }
    }
}

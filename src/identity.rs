//! Identity documents and the Ed25519-backed provider.
//!
//! An identity binds an author's signing key to a content-addressed document
//! `{id, publicKey, signatures, type}`. The current dialect stores the
//! document separately and entries reference it by hash; the legacy dialect
//! inlines the whole document into every entry.
//!
//! Signature chain (single keypair): `signatures.id` signs the `id` string,
//! `signatures.publicKey` signs `publicKey ∥ signatures.id`. Verifying the
//! chain proves the document author held the key it claims.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::{cid_to_base58, content_cid};
use crate::keys::{self, KeyPair};

/// Identity type tag carried in the document's `type` field.
pub const DEFAULT_IDENTITY_TYPE: &str = "orbitdb";

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown signing key for identity {0}")]
    UnknownKey(String),
    #[error("malformed key or signature: {0}")]
    Malformed(String),
    #[error("encode error: {0}")]
    Encode(String),
}

// ─── Document model ──────────────────────────────────────────────────────────

/// The two-link signature chain of an identity document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignatures {
    /// Hex signature over the `id` string, by the signing key.
    pub id: String,
    /// Hex signature over `publicKey ∥ signatures.id`, by the signing key.
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// The wire form of an identity document: both the dag-cbor block that is
/// content-addressed and the JSON object the legacy dialect inlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signatures: IdentitySignatures,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A resolved identity: the document plus its content address and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub document: IdentityDocument,
    /// base58btc CID of the dag-cbor document.
    pub hash: String,
    /// The dag-cbor document bytes.
    pub bytes: Vec<u8>,
}

impl Identity {
    /// The author's public key (hex), as carried in entry `key` fields.
    pub fn public_key(&self) -> &str {
        &self.document.public_key
    }

    /// Re-derive the content address for a bare document.
    pub fn from_document(document: IdentityDocument) -> Result<Self, IdentityError> {
        let bytes =
            serde_ipld_dagcbor::to_vec(&document).map_err(|e| IdentityError::Encode(e.to_string()))?;
        let hash =
            cid_to_base58(&content_cid(&bytes)).map_err(|e| IdentityError::Encode(e.to_string()))?;
        Ok(Identity { document, hash, bytes })
    }
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Creates identities, signs on their behalf, and verifies signatures.
///
/// Holds the signing keys it created, keyed by hex public key. Verification
/// never consults the key store, only the key material carried in the data
/// being checked.
#[derive(Default)]
pub struct Identities {
    signing_keys: HashMap<String, SigningKey>,
}

impl Identities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a signed identity document for `pair` and retain its signing key.
    pub fn create_identity(&mut self, pair: &KeyPair) -> Result<Identity, IdentityError> {
        let signing = keys::signing_key(pair).map_err(|e| IdentityError::Malformed(e.to_string()))?;

        let id = pair.public_key_hex.clone();
        let sig_id = hex::encode(signing.sign(id.as_bytes()).to_bytes());

        let mut chained = Vec::with_capacity(id.len() + sig_id.len());
        chained.extend_from_slice(pair.public_key_hex.as_bytes());
        chained.extend_from_slice(sig_id.as_bytes());
        let sig_pk = hex::encode(signing.sign(&chained).to_bytes());

        let document = IdentityDocument {
            id,
            public_key: pair.public_key_hex.clone(),
            signatures: IdentitySignatures { id: sig_id, public_key: sig_pk },
            kind: DEFAULT_IDENTITY_TYPE.to_string(),
        };

        self.signing_keys.insert(pair.public_key_hex.clone(), signing);
        Identity::from_document(document)
    }

    /// Sign `data` with the key behind `identity`. Fails if this provider
    /// did not create the identity.
    pub fn sign(&self, identity: &Identity, data: &[u8]) -> Result<String, IdentityError> {
        let key = self
            .signing_keys
            .get(identity.public_key())
            .ok_or_else(|| IdentityError::UnknownKey(identity.public_key().to_string()))?;
        Ok(hex::encode(key.sign(data).to_bytes()))
    }

    /// Check a hex signature by a hex public key over `data`.
    ///
    /// Returns `Ok(false)` when the signature does not verify; errors only on
    /// malformed key or signature material.
    pub fn verify_sig(
        &self,
        sig_hex: &str,
        public_key_hex: &str,
        data: &[u8],
    ) -> Result<bool, IdentityError> {
        let key_bytes: [u8; 32] = hex::decode(public_key_hex)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| IdentityError::Malformed("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;

        let sig_bytes: [u8; 64] = hex::decode(sig_hex)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| IdentityError::Malformed("signature must be 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_bytes);

        Ok(key.verify(data, &sig).is_ok())
    }

    /// Verify an identity document's internal signature chain.
    pub fn verify_identity(&self, identity: &Identity) -> Result<bool, IdentityError> {
        let doc = &identity.document;
        if !self.verify_sig(&doc.signatures.id, &doc.public_key, doc.id.as_bytes())? {
            return Ok(false);
        }
        let mut chained = Vec::with_capacity(doc.public_key.len() + doc.signatures.id.len());
        chained.extend_from_slice(doc.public_key.as_bytes());
        chained.extend_from_slice(doc.signatures.id.as_bytes());
        self.verify_sig(&doc.signatures.public_key, &doc.public_key, &chained)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

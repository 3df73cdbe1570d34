//! Database manifests: the content-addressed record a database address
//! points at.
//!
//! The record is `{name, type, accessController, meta?}`. The legacy dialect
//! writes the access controller under `access_controller` and renders the
//! hash base32; readers accept either field name and expose the canonical
//! one.

use ipld_core::ipld::Ipld;
use thiserror::Error;

use crate::canonical::{cid_to_base32, cid_to_base58, content_cid};
use crate::entry::Dialect;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// A decoded manifest record.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub kind: String,
    /// Address of (or inline description of) the database's access
    /// controller.
    pub access_controller: Ipld,
    pub meta: Option<Ipld>,
}

/// A manifest together with its encoded block and content address, ready for
/// any content-addressed store.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestBlock {
    pub manifest: Manifest,
    pub hash: String,
    pub bytes: Vec<u8>,
}

impl Manifest {
    /// Build and encode a manifest. `name`, `kind` and `access_controller`
    /// are required.
    pub fn create(
        name: &str,
        kind: &str,
        access_controller: Ipld,
        meta: Option<Ipld>,
        dialect: Dialect,
    ) -> Result<ManifestBlock, ManifestError> {
        if name.is_empty() {
            return Err(ManifestError::InvalidArgument("manifest requires a name".into()));
        }
        if kind.is_empty() {
            return Err(ManifestError::InvalidArgument("manifest requires a type".into()));
        }
        if matches!(access_controller, Ipld::Null) {
            return Err(ManifestError::InvalidArgument(
                "manifest requires an access controller".into(),
            ));
        }

        let manifest = Manifest {
            name: name.to_string(),
            kind: kind.to_string(),
            access_controller,
            meta,
        };
        let bytes = serde_ipld_dagcbor::to_vec(&manifest.to_document(dialect))
            .map_err(|e| ManifestError::Encode(e.to_string()))?;
        let cid = content_cid(&bytes);
        let hash = match dialect {
            Dialect::V2 => cid_to_base58(&cid),
            Dialect::V1 => cid_to_base32(&cid),
        }
        .map_err(|e| ManifestError::Encode(e.to_string()))?;

        Ok(ManifestBlock { manifest, hash, bytes })
    }

    /// Decode a manifest block, accepting either access-controller field
    /// name.
    pub fn decode(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        let value: Ipld =
            serde_ipld_dagcbor::from_slice(bytes).map_err(|e| ManifestError::Decode(e.to_string()))?;
        let map = match value {
            Ipld::Map(map) => map,
            _ => return Err(ManifestError::Decode("manifest is not a map".into())),
        };

        let name = match map.get("name") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err(ManifestError::Decode("manifest has no name".into())),
        };
        let kind = match map.get("type") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err(ManifestError::Decode("manifest has no type".into())),
        };
        let access_controller = map
            .get("accessController")
            .or_else(|| map.get("access_controller"))
            .cloned()
            .ok_or_else(|| ManifestError::Decode("manifest has no access controller".into()))?;
        let meta = map.get("meta").cloned();

        Ok(Manifest { name, kind, access_controller, meta })
    }

    fn to_document(&self, dialect: Dialect) -> Ipld {
        let controller_key = match dialect {
            Dialect::V2 => "accessController",
            Dialect::V1 => "access_controller",
        };
        let mut map = std::collections::BTreeMap::new();
        map.insert("name".to_string(), Ipld::String(self.name.clone()));
        map.insert("type".to_string(), Ipld::String(self.kind.clone()));
        map.insert(controller_key.to_string(), self.access_controller.clone());
        if let Some(meta) = &self.meta {
            map.insert("meta".to_string(), meta.clone());
        }
        Ipld::Map(map)
    }
}

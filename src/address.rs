//! Database addresses of the form `/orbitdb/<cid>[/<name>]`.

use std::fmt;

use cid::Cid;
use thiserror::Error;

const PROTOCOL: &str = "orbitdb";

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A parsed database address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Always `orbitdb`.
    pub protocol: String,
    /// The manifest content identifier, as written in the address.
    pub hash: String,
    /// Optional database name following the hash.
    pub name: Option<String>,
}

impl Address {
    /// Parse `/orbitdb/<cid>[/<name>]`. Fails with [`AddressError::InvalidAddress`]
    /// when the prefix is wrong or the first segment is not a content
    /// identifier.
    pub fn parse(address: &str) -> Result<Address, AddressError> {
        let rest = address
            .strip_prefix(&format!("/{PROTOCOL}/"))
            .ok_or_else(|| AddressError::InvalidAddress(address.to_string()))?;

        let mut segments = rest.splitn(2, '/');
        let hash = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AddressError::InvalidAddress(address.to_string()))?;
        Cid::try_from(hash).map_err(|_| AddressError::InvalidAddress(address.to_string()))?;

        let name = segments.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Address {
            protocol: PROTOCOL.to_string(),
            hash: hash.to_string(),
            name,
        })
    }

    /// True iff `address` parses.
    pub fn is_valid(address: &str) -> bool {
        Address::parse(address).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "/{}/{}/{}", self.protocol, self.hash, name),
            None => write!(f, "/{}/{}", self.protocol, self.hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{cid_to_base58, content_cid};

    fn valid_cid() -> String {
        cid_to_base58(&content_cid(b"manifest")).unwrap()
    }

    #[test]
    fn parse_with_name() {
        let addr = format!("/orbitdb/{}/db", valid_cid());
        let parsed = Address::parse(&addr).unwrap();
        assert_eq!(parsed.protocol, "orbitdb");
        assert_eq!(parsed.hash, valid_cid());
        assert_eq!(parsed.name.as_deref(), Some("db"));
        assert_eq!(parsed.to_string(), addr);
    }

    #[test]
    fn parse_without_name() {
        let addr = format!("/orbitdb/{}", valid_cid());
        let parsed = Address::parse(&addr).unwrap();
        assert_eq!(parsed.name, None);
        assert_eq!(parsed.to_string(), addr);
    }

    #[test]
    fn invalid_addresses_fail() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("/orbitdb/notacid").is_err());
        assert!(Address::parse("/elsewhere/whatever").is_err());
        assert!(!Address::is_valid("/orbitdb/"));
    }

    #[test]
    fn nested_name_segments_are_kept() {
        let addr = format!("/orbitdb/{}/a/b", valid_cid());
        let parsed = Address::parse(&addr).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("a/b"));
    }
}

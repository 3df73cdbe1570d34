//! Deterministic serialization for the legacy signing image.
//!
//! The legacy dialect signs canonical JSON: object keys sorted by code point
//! at every nesting level, no whitespace, integers without a decimal point.
//! The emitter walks a `serde_json::Value` tree and writes keys in sorted
//! order directly; no sorted copy is ever materialized.
//!
//! Also hosts the legacy value rules (the "replacer" and "reviver") that map
//! between in-memory IPLD values and their legacy JSON renderings, plus the
//! byte/string coercion helpers shared by both dialects.

use base64::{engine::general_purpose, Engine as _};
use cid::Cid;
use ipld_core::ipld::Ipld;
use serde_json::Value;
use thiserror::Error;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("value not representable in JSON: {0}")]
    Unrepresentable(String),
}

// ─── Canonical JSON ──────────────────────────────────────────────────────────

/// Serialize a JSON value tree with keys sorted at every level and no
/// whitespace. Stable under permutation of input object keys.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &serde_json::Number) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        // Integral floats are written without a decimal point, matching the
        // legacy emitter. serde_json cannot hold NaN or infinities.
        if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
            out.push_str(&(f as i64).to_string());
        } else {
            out.push_str(&n.to_string());
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json string serialization cannot fail.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

// ─── Legacy value rules ──────────────────────────────────────────────────────

/// The "replacer": project an in-memory IPLD value to its legacy JSON
/// rendering. Byte sequences become padded base64 strings; content
/// identifiers become their multibase (base58btc) string form.
pub fn ipld_to_legacy_json(value: &Ipld) -> Result<Value, CanonicalError> {
    Ok(match value {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => {
            let i = i64::try_from(*i)
                .map_err(|_| CanonicalError::Unrepresentable(format!("integer {i}")))?;
            Value::Number(i.into())
        }
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| CanonicalError::Unrepresentable(format!("float {f}")))?,
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(b) => Value::String(general_purpose::STANDARD.encode(b)),
        Ipld::Link(cid) => Value::String(cid_to_base58(cid)?),
        Ipld::List(items) => Value::Array(
            items
                .iter()
                .map(ipld_to_legacy_json)
                .collect::<Result<_, _>>()?,
        ),
        Ipld::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), ipld_to_legacy_json(v)?);
            }
            Value::Object(out)
        }
    })
}

/// The "reviver": reconstitute an in-memory IPLD value from legacy JSON.
///
/// * a `{"/": "<cid>"}` map whose string parses as a content identifier
///   becomes a link;
/// * a string that strictly decodes as padded base64 becomes bytes;
/// * a string with a leading `/` is preserved verbatim (addresses are not
///   base64).
///
/// The base64 rule is heuristic: a short plain string can decode
/// accidentally. Wire decoding in this crate is schema-directed and only
/// applies the rule where the legacy format demands it (operation-record
/// payload values); see `entry::legacy`.
pub fn legacy_json_to_ipld(value: &Value) -> Ipld {
    match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ipld::Integer(u as i128)
            } else {
                Ipld::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => revive_string(s),
        Value::Array(items) => Ipld::List(items.iter().map(legacy_json_to_ipld).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(s)) = map.get("/") {
                    if let Ok(cid) = Cid::try_from(s.as_str()) {
                        return Ipld::Link(cid);
                    }
                }
            }
            Ipld::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), legacy_json_to_ipld(v)))
                    .collect(),
            )
        }
    }
}

/// Plain JSON → IPLD conversion with no legacy heuristics: strings stay
/// strings. Used by the schema-directed decoder for fields whose type is
/// known to be ordinary JSON.
pub fn json_to_ipld(value: &Value) -> Ipld {
    match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ipld::Integer(u as i128)
            } else {
                Ipld::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Ipld::String(s.clone()),
        Value::Array(items) => Ipld::List(items.iter().map(json_to_ipld).collect()),
        Value::Object(map) => Ipld::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_ipld(v)))
                .collect(),
        ),
    }
}

/// Apply the base64 rule of the reviver to one string value.
pub fn revive_string(s: &str) -> Ipld {
    if s.starts_with('/') {
        return Ipld::String(s.to_string());
    }
    match general_purpose::STANDARD.decode(s) {
        Ok(bytes) if !s.is_empty() => Ipld::Bytes(bytes),
        _ => Ipld::String(s.to_string()),
    }
}

/// The IPLD dag-cbor multicodec code.
pub const DAG_CBOR_CODE: u64 = 0x71;

/// Content identifier for an encoded block: CIDv1, dag-cbor, sha2-256.
pub fn content_cid(bytes: &[u8]) -> Cid {
    use multihash_codetable::{Code, MultihashDigest};
    Cid::new_v1(DAG_CBOR_CODE, Code::Sha2_256.digest(bytes))
}

/// Render a content identifier under the base58btc multibase (`z…`).
pub fn cid_to_base58(cid: &Cid) -> Result<String, CanonicalError> {
    cid.to_string_of_base(multibase::Base::Base58Btc)
        .map_err(|e| CanonicalError::Unrepresentable(e.to_string()))
}

/// Render a content identifier under the base32 multibase (`b…`), the
/// legacy dialect's preferred form.
pub fn cid_to_base32(cid: &Cid) -> Result<String, CanonicalError> {
    cid.to_string_of_base(multibase::Base::Base32Lower)
        .map_err(|e| CanonicalError::Unrepresentable(e.to_string()))
}

// ─── Byte / string coercion ──────────────────────────────────────────────────

/// Named text encodings accepted by [`decode_string`] / [`encode_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Hex,
    Base64,
    Base58,
}

impl Encoding {
    /// Resolve an encoding by name. `base16` is an alias for `hex`.
    pub fn from_name(name: &str) -> Result<Self, CanonicalError> {
        match name {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "hex" | "base16" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            "base58" | "base58btc" => Ok(Encoding::Base58),
            other => Err(CanonicalError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Decode a string to bytes under the named encoding.
pub fn decode_string(s: &str, encoding: Encoding) -> Result<Vec<u8>, CanonicalError> {
    match encoding {
        Encoding::Utf8 => Ok(s.as_bytes().to_vec()),
        Encoding::Hex => hex::decode(s).map_err(|e| CanonicalError::Decode(e.to_string())),
        Encoding::Base64 => general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CanonicalError::Decode(e.to_string())),
        Encoding::Base58 => multibase::Base::Base58Btc
            .decode(s)
            .map_err(|e| CanonicalError::Decode(e.to_string())),
    }
}

/// Encode bytes to a string under the named encoding.
pub fn encode_string(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Hex => hex::encode(bytes),
        Encoding::Base64 => general_purpose::STANDARD.encode(bytes),
        Encoding::Base58 => multibase::Base::Base58Btc.encode(bytes),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": [3, 1]}});
        assert_eq!(
            to_canonical_json(&v),
            r#"{"a":{"m":[3,1],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_stable_under_permutation() {
        let a = json!({"x": 1, "y": {"p": "q", "r": "s"}, "z": [1, 2]});
        let b = json!({"z": [1, 2], "y": {"r": "s", "p": "q"}, "x": 1});
        assert_eq!(to_canonical_json(&a), to_canonical_json(&b));
    }

    #[test]
    fn canonical_json_integral_float_has_no_decimal_point() {
        let v = json!({"t": 2.0});
        assert_eq!(to_canonical_json(&v), r#"{"t":2}"#);
    }

    #[test]
    fn canonical_json_null_and_escapes() {
        let v = json!({"hash": null, "s": "a\"b"});
        assert_eq!(to_canonical_json(&v), r#"{"hash":null,"s":"a\"b"}"#);
    }

    #[test]
    fn replacer_encodes_bytes_as_padded_base64() {
        let v = Ipld::Bytes(b"hello".to_vec());
        assert_eq!(
            ipld_to_legacy_json(&v).unwrap(),
            Value::String("aGVsbG8=".into())
        );
    }

    #[test]
    fn reviver_decodes_padded_base64() {
        let out = legacy_json_to_ipld(&Value::String("aGVsbG8=".into()));
        assert_eq!(out, Ipld::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn reviver_preserves_leading_slash_strings() {
        let addr = "/orbitdb/zdpuAsomething/db";
        let out = legacy_json_to_ipld(&Value::String(addr.into()));
        assert_eq!(out, Ipld::String(addr.into()));
    }

    #[test]
    fn reviver_keeps_non_base64_strings() {
        let out = legacy_json_to_ipld(&Value::String("hello".into()));
        assert_eq!(out, Ipld::String("hello".into()));
    }

    #[test]
    fn reviver_resolves_slash_keyed_cid_maps() {
        let cid = sample_cid();
        let json = json!({"/": cid.to_string()});
        assert_eq!(legacy_json_to_ipld(&json), Ipld::Link(cid));
    }

    #[test]
    fn cid_multibase_prefixes() {
        let cid = sample_cid();
        assert!(cid_to_base58(&cid).unwrap().starts_with('z'));
        assert!(cid_to_base32(&cid).unwrap().starts_with('b'));
    }

    #[test]
    fn coercion_round_trips() {
        let bytes = b"\x00\x01orbit".to_vec();
        for enc in [Encoding::Hex, Encoding::Base64, Encoding::Base58] {
            let text = encode_string(&bytes, enc);
            assert_eq!(decode_string(&text, enc).unwrap(), bytes);
        }
        assert_eq!(decode_string("abc", Encoding::Utf8).unwrap(), b"abc");
    }

    #[test]
    fn encoding_names_resolve_with_aliases() {
        assert_eq!(Encoding::from_name("base16").unwrap(), Encoding::Hex);
        assert_eq!(Encoding::from_name("utf-8").unwrap(), Encoding::Utf8);
        assert!(Encoding::from_name("rot13").is_err());
    }

    fn sample_cid() -> Cid {
        use multihash_codetable::{Code, MultihashDigest};
        let mh = Code::Sha2_256.digest(b"sample");
        Cid::new_v1(0x71, mh)
    }
}

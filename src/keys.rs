use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key hex: {0}")]
    InvalidHex(String),
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
}

/// A signing keypair in transportable form.
pub struct KeyPair {
    /// Hex-encoded Ed25519 private key (32 bytes → 64 hex chars). Never logged.
    pub private_key_hex: String,
    /// Hex-encoded Ed25519 public key (32 bytes → 64 hex chars). This is the
    /// author identity carried in entry `key` and `clock.id` fields.
    pub public_key_hex: String,
}

/// Generate a brand-new Ed25519 keypair.
pub fn generate_keypair() -> KeyPair {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    keypair_from_seed(&seed)
}

/// Recover a keypair from a 64-char hex private key.
pub fn import_from_hex(private_key_hex: &str) -> Result<KeyPair, KeyError> {
    let bytes = hex::decode(private_key_hex).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPrivateKey)?;
    Ok(keypair_from_seed(&seed))
}

/// Materialize the dalek signing key for a keypair.
pub fn signing_key(pair: &KeyPair) -> Result<SigningKey, KeyError> {
    let bytes =
        hex::decode(&pair.private_key_hex).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPrivateKey)?;
    Ok(SigningKey::from_bytes(&seed))
}

fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing = SigningKey::from_bytes(seed);
    let verifying = signing.verifying_key();
    KeyPair {
        private_key_hex: hex::encode(seed),
        public_key_hex: hex::encode(verifying.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_reimport() {
        let kp1 = generate_keypair();
        assert_eq!(kp1.private_key_hex.len(), 64);
        assert_eq!(kp1.public_key_hex.len(), 64);

        let kp2 = import_from_hex(&kp1.private_key_hex).expect("valid hex");
        assert_eq!(kp1.public_key_hex, kp2.public_key_hex);
    }

    #[test]
    fn bad_hex_returns_error() {
        assert!(import_from_hex("not hex").is_err());
        assert!(import_from_hex("abcd").is_err()); // wrong length
    }

    #[test]
    fn signing_key_matches_public_key() {
        let kp = generate_keypair();
        let sk = signing_key(&kp).unwrap();
        assert_eq!(hex::encode(sk.verifying_key().as_bytes()), kp.public_key_hex);
    }
}

//! Ed25519 identity keys.
//!
//! Public keys travel as base58 strings, signatures as base64. A secret key is
//! stored in its expanded form: base58 of the 32-byte seed followed by the
//! 32-byte public key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Key handling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Not valid base58
    #[error("invalid base58: {0}")]
    Base58(String),

    /// Decoded key has the wrong size
    #[error("invalid key length {0}")]
    KeyLength(usize),

    /// Public half of an expanded secret does not match its seed
    #[error("secret key does not match its public key")]
    KeyMismatch,
}

/// A signing identity
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    pubkey: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("pubkey", &self.pubkey).finish()
    }
}

impl KeyPair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Build a keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Build a keypair from a base58 expanded secret key (seed then public key)
    pub fn from_base58_secret(secret: &str) -> Result<Self, CryptoError> {
        let bytes = bs58::decode(secret)
            .into_vec()
            .map_err(|e| CryptoError::Base58(e.to_string()))?;
        let bytes: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        let signing = SigningKey::from_keypair_bytes(&bytes).map_err(|_| CryptoError::KeyMismatch)?;
        Ok(Self::from_signing_key(signing))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let pubkey = bs58::encode(signing.verifying_key().as_bytes()).into_string();
        Self { signing, pubkey }
    }

    /// Base58 public key
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Base58 expanded secret key
    pub fn secret_base58(&self) -> String {
        bs58::encode(self.signing.to_keypair_bytes()).into_string()
    }

    /// Sign a message, returning a base64 signature
    pub fn sign(&self, message: &str) -> String {
        STANDARD.encode(self.signing.sign(message.as_bytes()).to_bytes())
    }
}

/// Verify a base64 signature over `message` against a base58 public key.
///
/// Any decoding failure counts as an invalid signature.
pub fn verify(message: &str, sig: &str, pubkey: &str) -> bool {
    let Ok(key_bytes) = bs58::decode(pubkey).into_vec() else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(sig) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message.as_bytes(), &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign("WS2P:HEAD:x");
        assert_eq!(sig.len(), 88);
        assert!(verify("WS2P:HEAD:x", &sig, pair.pubkey()));
        assert!(!verify("WS2P:HEAD:y", &sig, pair.pubkey()));
        assert!(!verify("WS2P:HEAD:x", &sig, KeyPair::generate().pubkey()));
    }

    #[test]
    fn test_garbage_never_verifies() {
        let pair = KeyPair::generate();
        assert!(!verify("m", "not base64!", pair.pubkey()));
        assert!(!verify("m", &pair.sign("m"), "0OIl"));
        assert!(!verify("m", "", ""));
    }

    #[test]
    fn test_expanded_secret_restores_same_identity() {
        let pair = KeyPair::from_seed(&[7u8; 32]);
        let restored = KeyPair::from_base58_secret(&pair.secret_base58()).unwrap();
        assert_eq!(restored.pubkey(), pair.pubkey());
        assert!(matches!(
            KeyPair::from_base58_secret(pair.pubkey()),
            Err(CryptoError::KeyLength(32))
        ));
    }
}

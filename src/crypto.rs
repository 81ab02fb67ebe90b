use crate::error::{LendError, Result};
use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A publisher identity used by `OracleGateway` to verify signed price quotes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl KeyPair {
    pub fn new() -> Result<Self> {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);

        Ok(KeyPair {
            private_key: secret_key.secret_bytes().to_vec(),
            public_key: public_key.serialize().to_vec(),
        })
    }

    pub fn from_private_key(private_key: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|e| LendError::Crypto(e.to_string()))?;
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        Ok(KeyPair {
            private_key: private_key.to_vec(),
            public_key: public_key.serialize().to_vec(),
        })
    }

    /// Signs the SHA-256 digest of `message` (e.g. the canonical encoding of a price quote).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&self.private_key)
            .map_err(|e| LendError::Crypto(e.to_string()))?;

        let message_hash = sha256(message);
        let message = Message::from_slice(&message_hash)
            .map_err(|e| LendError::Crypto(e.to_string()))?;

        let signature = secp.sign_ecdsa(&message, &secret_key);
        Ok(signature.serialize_compact().to_vec())
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair {{ public_key: {} }}", hex::encode(&self.public_key))
    }
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Verifies a compact-encoded secp256k1 ECDSA signature over the SHA-256 digest
/// of `message`. Used by `OracleGateway` to check a quote's publisher signature
/// and by nothing else in this core — no address derivation, no proof-of-work.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let secp = Secp256k1::new();

    let public_key =
        PublicKey::from_slice(public_key).map_err(|e| LendError::Crypto(e.to_string()))?;

    let message_hash = sha256(message);
    let message =
        Message::from_slice(&message_hash).map_err(|e| LendError::Crypto(e.to_string()))?;

    let signature =
        Signature::from_compact(signature).map_err(|e| LendError::Crypto(e.to_string()))?;

    match secp.verify_ecdsa(&message, &signature, &public_key) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

pub fn hash_to_string(hash: &[u8]) -> String {
    hex::encode(hash)
}

pub fn string_to_hash(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| LendError::Crypto(e.to_string()))
}

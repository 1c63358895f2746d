//! Signing keys for settlement requests
//!
//! The settlement gateway authenticates every call by a secp256k1 signature
//! over the canonical request parameters. Keys are loaded from configuration.

use crate::error::ReservationError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Chain account address: SHA-256 of the compressed public key.
pub type Address = [u8; 32];

pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

/// Parse and validate a hex-encoded 32-byte address.
pub fn address_from_hex(hex_str: &str) -> Result<Address, ReservationError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ReservationError::Crypto(format!("Invalid hex address: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ReservationError::Crypto(format!(
            "Address must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    bytes
        .try_into()
        .map_err(|_| ReservationError::Crypto("Failed to convert bytes into address".to_string()))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Load a key pair from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ReservationError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ReservationError::Crypto(format!("Invalid hex secret key: {}", e)))?;
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(ReservationError::Crypto(format!(
                "Secret key must be {} bytes, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            )));
        }
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| ReservationError::Crypto(format!("Invalid secret key bytes: {}", e)))?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn address(&self) -> Address {
        Sha256::digest(self.public_key.serialize()).into()
    }

    pub fn address_hex(&self) -> String {
        address_to_hex(&self.address())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Sign the SHA-256 digest of `message`, returning the compact signature.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ReservationError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ReservationError::Crypto(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

/// Verify a compact ECDSA signature against a compressed public key.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ReservationError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ReservationError::Crypto(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ReservationError::Crypto(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ReservationError::Crypto(format!("Invalid public key: {}", e)))?;
    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ReservationError::Crypto(format!("Failed to create message: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ReservationError::Crypto(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ReservationError::Crypto("Signature verification failed".to_string()))
}

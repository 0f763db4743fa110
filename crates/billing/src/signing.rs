//! Ledger request signing
//!
//! Every ledger request is signed with the service's secp256k1 key. The
//! signed message is `METHOD\nPATH\nBODY`, hashed with SHA-256; the body
//! carries a nonce that only ever increases so a captured request cannot be
//! replayed.

use std::sync::atomic::{AtomicU64, Ordering};

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub const PUBKEY_HEADER: &str = "x-pubkey";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const NONCE_HEADER: &str = "x-nonce";

/// Bytes that get signed for a request
pub fn signing_digest(method: &str, path: &str, body: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    hasher.finalize().into()
}

/// Signs ledger requests and hands out nonces
pub struct RequestSigner {
    key: SigningKey,
    public_key_hex: String,
    last_nonce: AtomicU64,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("public_key", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(key: SigningKey) -> Self {
        let public_key_hex = hex::encode(key.verifying_key().to_encoded_point(true).as_bytes());
        Self {
            key,
            public_key_hex,
            last_nonce: AtomicU64::new(0),
        }
    }

    /// Load a raw 32-byte private key given as hex
    pub fn from_hex(private_key_hex: &str) -> BillingResult<Self> {
        let bytes = hex::decode(private_key_hex.trim())
            .map_err(|e| BillingError::Signing(format!("private key is not hex: {}", e)))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| BillingError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self::new(key))
    }

    /// Compressed SEC1 public key, hex encoded
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Millisecond clock, bumped by one whenever two requests share a tick
    pub fn next_nonce(&self) -> u64 {
        let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        let mut previous = self.last_nonce.load(Ordering::Acquire);
        loop {
            let next = now.max(previous + 1);
            match self.last_nonce.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Hex encoded 64-byte signature over the request
    pub fn sign(&self, method: &str, path: &str, body: &str) -> BillingResult<String> {
        let digest = signing_digest(method, path, body);
        let signature: Signature = self
            .key
            .sign_prehash(&digest)
            .map_err(|e| BillingError::Signing(e.to_string()))?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Check a request signature the way the ledger does
pub fn verify(
    public_key_hex: &str,
    method: &str,
    path: &str,
    body: &str,
    signature_hex: &str,
) -> BillingResult<bool> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|e| BillingError::Signing(format!("public key is not hex: {}", e)))?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| BillingError::Signing(format!("invalid public key: {}", e)))?;
    let signature_bytes = hex::decode(signature_hex)
        .map_err(|e| BillingError::Signing(format!("signature is not hex: {}", e)))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| BillingError::Signing(format!("invalid signature: {}", e)))?;

    let digest = signing_digest(method, path, body);
    Ok(key.verify_prehash(&digest, &signature).is_ok())
}

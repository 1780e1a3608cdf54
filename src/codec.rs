//! Payload transforms: compression, encryption, checksums and signatures
//!
//! Stored payloads go through `compress -> encrypt -> base64`. The checksum
//! and signature are always computed over the final encoded string, i.e.
//! exactly what lands in `BackupPackage::data`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{KeepsakeError, Result};
use crate::types::ENCRYPTION_AES_256_GCM;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const ZSTD_LEVEL: i32 = 3;
const SIGNATURE_DOMAIN: &[u8] = b"keepsake.signature.v1";

/// SHA-256 of data, hex encoded
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checksum of a JSON value's canonical serialization
///
/// `serde_json::Map` keeps keys sorted, so equal values hash equally.
pub fn checksum_value(value: &serde_json::Value) -> String {
    checksum(value.to_string().as_bytes())
}

/// Checksum recorded for a deleted entity
pub fn tombstone_checksum() -> String {
    checksum(b"keepsake.tombstone")
}

/// Checksum of an entity state, where `None` is a deleted entity
pub fn state_checksum(state: Option<&serde_json::Value>) -> String {
    state.map(checksum_value).unwrap_or_else(tombstone_checksum)
}

/// Authenticity marker over a stored payload.
///
/// This is a keyed-by-id digest, not an asymmetric signature; it detects
/// accidental mismatch between metadata and payload, not a hostile provider.
pub fn sign(backup_id: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SIGNATURE_DOMAIN);
    hasher.update(backup_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn verify_signature(backup_id: &str, data: &[u8], signature: &str) -> bool {
    sign(backup_id, data) == signature
}

/// Compress with zstd
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(data, ZSTD_LEVEL).map_err(|e| KeepsakeError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data).map_err(|e| KeepsakeError::Compression(e.to_string()))
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| KeepsakeError::Integrity(format!("Invalid base64 payload: {}", e)))
}

/// A 256-bit AES key with a stable short identifier
#[derive(Clone)]
pub struct EncryptionKey {
    id: String,
    bytes: [u8; KEY_LEN],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl EncryptionKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let id = checksum(&bytes)[..16].to_string();
        Self { id, bytes }
    }

    /// Import a base64-encoded key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| KeepsakeError::Encryption(format!("Invalid key encoding: {}", e)))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| {
            KeepsakeError::Encryption(format!("Key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes).map_err(|e| KeepsakeError::Encryption(e.to_string()))
    }
}

fn ensure_supported(method: &str) -> Result<()> {
    if method == ENCRYPTION_AES_256_GCM {
        Ok(())
    } else {
        Err(KeepsakeError::Encryption(format!(
            "Unsupported encryption method: {}",
            method
        )))
    }
}

/// Encrypt data; the random nonce is prepended to the ciphertext
pub fn encrypt(key: &EncryptionKey, method: &str, data: &[u8]) -> Result<Vec<u8>> {
    ensure_supported(method)?;
    let cipher = key.cipher()?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| KeepsakeError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

pub fn decrypt(key: &EncryptionKey, method: &str, data: &[u8]) -> Result<Vec<u8>> {
    ensure_supported(method)?;
    if data.len() < NONCE_LEN {
        return Err(KeepsakeError::Encryption("Data too short".to_string()));
    }

    let cipher = key.cipher()?;
    let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|e| KeepsakeError::Encryption(e.to_string()))
}

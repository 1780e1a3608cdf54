//! Integrity verification for backup packages
//!
//! Verification is a dry run of the restore decode path: checksum and
//! signature over the stored payload, then decrypt, decompress and parse.
//! Each step is isolated so a failure only clears its own flag, and the
//! package is `valid` only when every flag is set.

use crate::codec::{self, EncryptionKey};
use crate::error::{KeepsakeError, Result};
use crate::types::{
    BackupData, BackupPackage, BackupVerification, DATA_VERSION, MIN_SUPPORTED_DATA_VERSION,
};

/// Certifies packages as restorable before any local data is touched
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    min_version: u32,
    current_version: u32,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(MIN_SUPPORTED_DATA_VERSION, DATA_VERSION)
    }
}

impl IntegrityVerifier {
    pub fn new(min_version: u32, current_version: u32) -> Self {
        Self {
            min_version,
            current_version,
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Run every check against `package`; never fails, never mutates
    pub fn verify(&self, package: &BackupPackage, key: Option<&EncryptionKey>) -> BackupVerification {
        let metadata = &package.metadata;
        let payload = package.data.as_bytes();
        let mut result = BackupVerification::default();

        result.checksum_valid = codec::checksum(payload) == metadata.checksum;
        if !result.checksum_valid {
            result
                .errors
                .push("Checksum mismatch: payload does not match metadata".to_string());
        }

        result.signature_valid = codec::verify_signature(&metadata.id, payload, &package.signature);
        if !result.signature_valid {
            result.errors.push("Signature verification failed".to_string());
        }

        match self.decrypt_stage(package, key) {
            Ok(bytes) => {
                result.decrypt_valid = true;
                match self.parse_stage(package, &bytes) {
                    Ok(_) => result.parse_valid = true,
                    Err(e) => result.errors.push(e.to_string()),
                }
            }
            Err(e) => result.errors.push(e.to_string()),
        }

        result.version_compatible = metadata.data_version >= self.min_version;
        if !result.version_compatible {
            result.errors.push(format!(
                "Data version {} is older than the oldest supported version {}",
                metadata.data_version, self.min_version
            ));
        }

        result.finalize()
    }

    /// Decode a package into the snapshot it carries
    pub fn decode(&self, package: &BackupPackage, key: Option<&EncryptionKey>) -> Result<BackupData> {
        let bytes = self.decrypt_stage(package, key)?;
        self.parse_stage(package, &bytes)
    }

    /// Undo the text encoding and encryption
    fn decrypt_stage(&self, package: &BackupPackage, key: Option<&EncryptionKey>) -> Result<Vec<u8>> {
        let metadata = &package.metadata;
        if !metadata.compressed && !metadata.encrypted {
            return Ok(package.data.as_bytes().to_vec());
        }

        let bytes = codec::decode_base64(&package.data)?;
        if !metadata.encrypted {
            return Ok(bytes);
        }

        let key = key.ok_or_else(|| {
            KeepsakeError::Encryption("Backup is encrypted but no key is available".to_string())
        })?;
        if let Some(expected) = &metadata.key_id {
            if expected != key.id() {
                return Err(KeepsakeError::Encryption(format!(
                    "Backup was encrypted with key {}, local key is {}",
                    expected,
                    key.id()
                )));
            }
        }
        let method = metadata
            .encryption_method
            .as_deref()
            .ok_or_else(|| KeepsakeError::Encryption("Missing encryption method".to_string()))?;

        codec::decrypt(key, method, &bytes)
            .map_err(|e| KeepsakeError::Encryption(format!("Decryption failed: {}", e)))
    }

    /// Decompress if flagged, then parse the snapshot
    fn parse_stage(&self, package: &BackupPackage, bytes: &[u8]) -> Result<BackupData> {
        let decompressed;
        let json = if package.metadata.compressed {
            decompressed = codec::decompress(bytes)
                .map_err(|e| KeepsakeError::Integrity(format!("Decompression failed: {}", e)))?;
            &decompressed[..]
        } else {
            bytes
        };

        serde_json::from_slice(json)
            .map_err(|e| KeepsakeError::Integrity(format!("Parse failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackupMetadata, ENCRYPTION_AES_256_GCM};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot_json() -> Vec<u8> {
        let mut data = BackupData::new();
        data.insert("symptoms", vec![json!({"id": "s1", "name": "cough"})]);
        serde_json::to_vec(&data).unwrap()
    }

    fn build(compress: bool, key: Option<&EncryptionKey>) -> BackupPackage {
        let raw = snapshot_json();
        let mut bytes = raw.clone();
        if compress {
            bytes = codec::compress(&bytes).unwrap();
        }
        if let Some(key) = key {
            bytes = codec::encrypt(key, ENCRYPTION_AES_256_GCM, &bytes).unwrap();
        }
        let data = if compress || key.is_some() {
            codec::encode_base64(&bytes)
        } else {
            String::from_utf8(bytes).unwrap()
        };

        let id = "backup-1".to_string();
        BackupPackage {
            metadata: BackupMetadata {
                id: id.clone(),
                created_at: Utc::now(),
                app_version: "test".to_string(),
                data_version: DATA_VERSION,
                manual: true,
                entities: BTreeMap::new(),
                raw_size: raw.len() as u64,
                compressed_size: data.len() as u64,
                compressed: compress,
                encrypted: key.is_some(),
                encryption_method: key.map(|_| ENCRYPTION_AES_256_GCM.to_string()),
                key_id: key.map(|k| k.id().to_string()),
                provider: "memory".to_string(),
                checksum: codec::checksum(data.as_bytes()),
            },
            signature: codec::sign(&id, data.as_bytes()),
            data,
        }
    }

    #[test]
    fn test_plain_package_is_valid() {
        let verifier = IntegrityVerifier::default();
        let result = verifier.verify(&build(false, None), None);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_compressed_encrypted_package_is_valid() {
        let key = EncryptionKey::generate();
        let package = build(true, Some(&key));
        let verifier = IntegrityVerifier::default();

        let result = verifier.verify(&package, Some(&key));
        assert!(result.valid, "{:?}", result.errors);

        let data = verifier.decode(&package, Some(&key)).unwrap();
        assert_eq!(data.total_entities(), 1);
    }

    #[test]
    fn test_missing_or_wrong_key_fails_decrypt_only() {
        let key = EncryptionKey::generate();
        let package = build(true, Some(&key));
        let verifier = IntegrityVerifier::default();

        let result = verifier.verify(&package, None);
        assert!(!result.valid);
        assert!(result.checksum_valid);
        assert!(result.signature_valid);
        assert!(!result.decrypt_valid);

        let other = EncryptionKey::generate();
        let result = verifier.verify(&package, Some(&other));
        assert!(!result.decrypt_valid);
        assert!(!result.valid);
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let mut package = build(false, None);
        package.data = package.data.replace("cough", "cougH");

        let result = IntegrityVerifier::default().verify(&package, None);
        assert!(!result.checksum_valid);
        assert!(!result.signature_valid);
        assert!(result.parse_valid);
        assert!(!result.valid);
    }

    #[test]
    fn test_old_data_version_is_incompatible() {
        let mut package = build(false, None);
        package.metadata.data_version = 0;

        let result = IntegrityVerifier::default().verify(&package, None);
        assert!(!result.version_compatible);
        assert!(!result.valid);
    }

    #[test]
    fn test_newer_data_version_is_compatible() {
        let mut package = build(false, None);
        package.metadata.data_version = DATA_VERSION + 3;

        let result = IntegrityVerifier::default().verify(&package, None);
        assert!(result.version_compatible);
    }

    #[test]
    fn test_verification_is_idempotent() {
        let key = EncryptionKey::generate();
        let package = build(true, Some(&key));
        let verifier = IntegrityVerifier::default();
        assert_eq!(
            verifier.verify(&package, Some(&key)),
            verifier.verify(&package, Some(&key))
        );
    }
}

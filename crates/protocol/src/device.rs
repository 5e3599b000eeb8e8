//! Approved-device store.
//!
//! Devices are paired out-of-band; the store records each approved device
//! id with its secret key. During `connect`, a device proves possession of
//! the key by MACing the server-issued challenge nonce:
//!
//! `signature = hex(HMAC-SHA256(key, nonce || "." || signed_at))`

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use ag_domain::{Error, Result};

use crate::frames::DeviceIdentity;

type HmacSha256 = Hmac<Sha256>;

/// One approved device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Hex-encoded shared key established at pairing time.
    pub key_hex: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Approved devices, persisted to `devices.json` under the state dir.
pub struct DeviceStore {
    path: Option<PathBuf>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceStore {
    /// Load (or start empty) from `<state_dir>/devices.json`.
    pub fn load(state_dir: &std::path::Path) -> Result<Self> {
        let path = state_dir.join("devices.json");
        let devices = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        tracing::info!(devices = devices.len(), path = %path.display(), "device store loaded");
        Ok(Self { path: Some(path), devices: RwLock::new(devices) })
    }

    /// An unpersisted store, for tests.
    pub fn in_memory() -> Self {
        Self { path: None, devices: RwLock::new(HashMap::new()) }
    }

    /// Approve a device. Persists immediately.
    pub fn approve(&self, record: DeviceRecord) -> Result<()> {
        self.devices
            .write()
            .insert(record.device_id.clone(), record);
        self.persist()
    }

    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let removed = self.devices.write().remove(device_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Verify a device-identity presentation against the challenge nonce.
    ///
    /// Returns the rejection reason on failure (`device_unknown`,
    /// `device_signature`).
    pub fn verify(
        &self,
        identity: &DeviceIdentity,
        challenge_nonce: &str,
    ) -> std::result::Result<(), &'static str> {
        let record = self
            .get(&identity.id)
            .ok_or("device_unknown")?;

        let key = hex::decode(&record.key_hex).map_err(|_| "device_unknown")?;
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| "device_unknown")?;
        mac.update(challenge_nonce.as_bytes());
        mac.update(b".");
        mac.update(identity.signed_at.as_bytes());
        let expected = mac.finalize().into_bytes();

        let presented = hex::decode(&identity.signature).map_err(|_| "device_signature")?;
        if presented.len() != expected.len() {
            return Err("device_signature");
        }
        if bool::from(expected.ct_eq(presented.as_slice())) {
            Ok(())
        } else {
            Err("device_signature")
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let devices = self.devices.read();
        let json = serde_json::to_string_pretty(&*devices)?;
        write_atomic(path, json.as_bytes())
    }
}

/// Serialize → temp file in the same directory → fsync → rename.
pub fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Store(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tmp
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path)
        .map_err(|e| Error::Store(format!("rename over {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Compute the signature a device would present for a nonce. Used by
/// pairing flows and tests.
pub fn sign_challenge(key: &[u8], nonce: &str, signed_at: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(nonce.as_bytes());
    mac.update(b".");
    mac.update(signed_at.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approved_store(key: &[u8]) -> DeviceStore {
        let store = DeviceStore::in_memory();
        store
            .approve(DeviceRecord {
                device_id: "dev1".into(),
                key_hex: hex::encode(key),
                approved_at: Utc::now(),
                label: None,
            })
            .unwrap();
        store
    }

    fn identity(signature: String) -> DeviceIdentity {
        DeviceIdentity {
            id: "dev1".into(),
            public_key: String::new(),
            signature,
            signed_at: "1700000000".into(),
            nonce: None,
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let key = b"super-secret-device-key";
        let store = approved_store(key);
        let sig = sign_challenge(key, "nonce123", "1700000000");
        assert!(store.verify(&identity(sig), "nonce123").is_ok());
    }

    #[test]
    fn unknown_device_rejected() {
        let store = DeviceStore::in_memory();
        let sig = sign_challenge(b"k", "nonce123", "1700000000");
        assert_eq!(store.verify(&identity(sig), "nonce123"), Err("device_unknown"));
    }

    #[test]
    fn wrong_nonce_rejected() {
        let key = b"super-secret-device-key";
        let store = approved_store(key);
        let sig = sign_challenge(key, "other-nonce", "1700000000");
        assert_eq!(store.verify(&identity(sig), "nonce123"), Err("device_signature"));
    }

    #[test]
    fn garbage_signature_rejected() {
        let store = approved_store(b"k");
        assert_eq!(
            store.verify(&identity("zz-not-hex".into()), "nonce123"),
            Err("device_signature")
        );
    }

    #[test]
    fn store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DeviceStore::load(dir.path()).unwrap();
            store
                .approve(DeviceRecord {
                    device_id: "dev9".into(),
                    key_hex: hex::encode(b"key"),
                    approved_at: Utc::now(),
                    label: Some("laptop".into()),
                })
                .unwrap();
        }
        let store = DeviceStore::load(dir.path()).unwrap();
        assert!(store.get("dev9").is_some());
        assert_eq!(store.len(), 1);
    }
}

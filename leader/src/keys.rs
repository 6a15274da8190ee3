//! The key material a leader hands to its workers

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A container of keys that can be copied out and serialized for
/// transfer. The container may change while syncs are in flight, so
/// the leader always works on a copy.
pub trait KeySet: Sync {
    type Snapshot: Serialize;

    /// Take a consistent copy of the current keys
    fn copy(&self) -> Self::Snapshot;

    /// Serialize a fresh copy of the keys
    fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.copy())
    }
}

/// The keys shared by every enclave in one trust domain
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// DER encoded certificate of the enclave's TLS endpoint
    #[serde(with = "hex::serde")]
    pub node_cert: Vec<u8>,
    /// Private key of the enclave's TLS endpoint
    #[serde(with = "hex::serde")]
    pub node_key: Vec<u8>,
    /// Opaque keys of the application running in the enclave
    #[serde(with = "hex::serde")]
    pub app_keys: Vec<u8>,
}

/// Thread-safe holder of an enclave's [`KeyMaterial`]
#[derive(Debug, Default)]
pub struct EnclaveKeys {
    inner: RwLock<KeyMaterial>,
}

impl EnclaveKeys {
    pub fn new(keys: KeyMaterial) -> Self {
        Self {
            inner: RwLock::new(keys),
        }
    }

    /// Load keys from a JSON file
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let contents = zeroize::Zeroizing::new(std::fs::read(path)?);
        let keys = serde_json::from_slice(&contents).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Could not parse key file: {e}"),
            )
        })?;
        Ok(Self::new(keys))
    }

    pub fn set_node_keys(&self, cert: Vec<u8>, key: Vec<u8>) {
        let mut keys = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        keys.node_key.zeroize();
        keys.node_cert = cert;
        keys.node_key = key;
    }

    pub fn set_app_keys(&self, app_keys: Vec<u8>) {
        let mut keys = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        keys.app_keys.zeroize();
        keys.app_keys = app_keys;
    }
}

impl KeySet for EnclaveKeys {
    type Snapshot = KeyMaterial;

    fn copy(&self) -> KeyMaterial {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

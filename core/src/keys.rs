// Copyright (c) 2022-2023 The MobileCoin Foundation

//! PSK key stores
//!
//! Keys are looked up by identity during the TLS handshake. The
//! security contract is absolute: key bytes never appear in logs,
//! error messages or emitted events. Identities are not secret and may
//! be logged freely.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, info, warn};
use serde::Deserialize;

/// Keys shorter than this trigger a load-time warning
const MIN_KEY_BYTES: usize = 16;

/// Raw PSK key material.
///
/// Deliberately opaque: no `Display`, and `Debug` prints only the
/// length. Callbacks receive keys by value and must not retain them.
#[derive(Clone, PartialEq, Eq)]
pub struct PskKey(Vec<u8>);

impl PskKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse from a hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyStoreError> {
        hex::decode(hex_str)
            .map(Self)
            .map_err(|_| KeyStoreError::InvalidKeyEncoding)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PskKey(<{} bytes>)", self.0.len())
    }
}

/// Key store errors.
///
/// Messages are content-free with respect to key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read key store '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid key store document '{path}': {source}")]
    Format {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A key value was not valid hex (identity reported by the caller)
    #[error("key value is not valid hex")]
    InvalidKeyEncoding,

    #[error("invalid key for identity '{0}': value is not valid hex")]
    InvalidKey(String),

    #[error("repository error: {0}")]
    Repository(String),
}

/// PSK lookup capability.
///
/// Implementations must never log key material; repository backends are
/// held to the same contract.
pub trait KeyStore: Send + Sync {
    /// Retrieve the key for an identity, if known
    fn get_key(&self, identity: &str) -> Option<PskKey>;

    /// Check whether an identity is known
    fn identity_exists(&self, identity: &str) -> bool {
        self.get_key(identity).is_some()
    }

    /// List all known identities
    fn list_identities(&self) -> Vec<String>;
}

#[derive(Deserialize)]
struct KeyDocument {
    keys: HashMap<String, String>,
}

/// File-backed key store.
///
/// Loads a YAML document with a `keys:` mapping of identity to
/// hex-encoded key. Keys are loaded eagerly; [`reload`][Self::reload]
/// replaces the whole set.
#[derive(Debug)]
pub struct FileKeyStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, PskKey>>,
}

impl FileKeyStore {
    /// Load a key store from the given file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let path = path.as_ref().to_path_buf();
        let keys = Self::read_keys(&path)?;

        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    /// Re-read the backing file, replacing all keys
    pub fn reload(&self) -> Result<(), KeyStoreError> {
        let keys = Self::read_keys(&self.path)?;
        *self.keys.write().unwrap() = keys;
        info!("reloaded key store from {}", self.path.display());
        Ok(())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_keys(path: &Path) -> Result<HashMap<String, PskKey>, KeyStoreError> {
        if !path.exists() {
            return Err(KeyStoreError::FileNotFound(path.to_path_buf()));
        }

        let text = std::fs::read_to_string(path).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let doc: KeyDocument =
            serde_yaml::from_str(&text).map_err(|source| KeyStoreError::Format {
                path: path.to_path_buf(),
                source,
            })?;

        let mut keys = HashMap::with_capacity(doc.keys.len());

        for (identity, key_hex) in doc.keys {
            let key = PskKey::from_hex(&key_hex)
                .map_err(|_| KeyStoreError::InvalidKey(identity.clone()))?;

            if key.len() < MIN_KEY_BYTES {
                warn!(
                    "PSK key for identity '{identity}' is shorter than {MIN_KEY_BYTES} bytes"
                );
            }

            keys.insert(identity, key);
        }

        // Identities only, never values
        let mut identities: Vec<&String> = keys.keys().collect();
        identities.sort();
        info!(
            "loaded {} PSK identities from {}: {identities:?}",
            keys.len(),
            path.display(),
        );

        Ok(keys)
    }
}

impl KeyStore for FileKeyStore {
    fn get_key(&self, identity: &str) -> Option<PskKey> {
        let key = self.keys.read().unwrap().get(identity).cloned();
        match key {
            Some(k) => {
                debug!("PSK identity found: {identity}");
                Some(k)
            }
            None => {
                debug!("PSK identity not found: {identity}");
                None
            }
        }
    }

    fn identity_exists(&self, identity: &str) -> bool {
        self.keys.read().unwrap().contains_key(identity)
    }

    fn list_identities(&self) -> Vec<String> {
        let mut v: Vec<String> = self.keys.read().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

/// In-memory key store for tests and development
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, PskKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key
    pub fn add_key(&self, identity: impl Into<String>, key: PskKey) {
        let identity = identity.into();
        debug!("added PSK identity to memory store: {identity}");
        self.keys.write().unwrap().insert(identity, key);
    }

    /// Remove a key, returning whether it existed
    pub fn remove_key(&self, identity: &str) -> bool {
        self.keys.write().unwrap().remove(identity).is_some()
    }

    /// Remove all keys
    pub fn clear(&self) {
        self.keys.write().unwrap().clear();
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_key(&self, identity: &str) -> Option<PskKey> {
        self.keys.read().unwrap().get(identity).cloned()
    }

    fn identity_exists(&self, identity: &str) -> bool {
        self.keys.read().unwrap().contains_key(identity)
    }

    fn list_identities(&self) -> Vec<String> {
        let mut v: Vec<String> = self.keys.read().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

/// External repository contract for database-backed key storage.
///
/// Implementors must not log key material.
pub trait KeyRepository: Send + Sync {
    fn psk_key_by_identity(&self, identity: &str) -> Result<Option<PskKey>, KeyStoreError>;

    fn psk_identity_exists(&self, identity: &str) -> Result<bool, KeyStoreError>;

    fn psk_identities(&self) -> Result<Vec<String>, KeyStoreError>;
}

/// Key store over an external [`KeyRepository`].
///
/// Backend failures degrade to "identity unknown" with a logged error
/// rather than failing the handshake path.
pub struct RepositoryKeyStore<R: KeyRepository> {
    repository: R,
}

impl<R: KeyRepository> RepositoryKeyStore<R> {
    pub fn new(repository: R) -> Self {
        info!("initialised repository-backed key store");
        Self { repository }
    }
}

impl<R: KeyRepository> KeyStore for RepositoryKeyStore<R> {
    fn get_key(&self, identity: &str) -> Option<PskKey> {
        match self.repository.psk_key_by_identity(identity) {
            Ok(key) => key,
            Err(e) => {
                log::error!("repository error retrieving PSK for '{identity}': {e}");
                None
            }
        }
    }

    fn identity_exists(&self, identity: &str) -> bool {
        match self.repository.psk_identity_exists(identity) {
            Ok(v) => v,
            Err(e) => {
                log::error!("repository error checking identity '{identity}': {e}");
                false
            }
        }
    }

    fn list_identities(&self) -> Vec<String> {
        match self.repository.psk_identities() {
            Ok(v) => v,
            Err(e) => {
                log::error!("repository error listing identities: {e}");
                Vec::new()
            }
        }
    }
}

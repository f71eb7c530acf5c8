// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Server configuration
//!
//! A single [`ServerConfig`] value is threaded through the composition
//! root; nothing reads configuration globally. Invalid configuration is
//! a startup failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::errors::ErrorEngineConfig;
use crate::session::SessionStoreConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config document '{path}': {source}")]
    Format {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// PSK cipher suites the policy can enable, by IANA name
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum CipherSuite {
    #[strum(serialize = "TLS_PSK_WITH_AES_128_CBC_SHA256")]
    #[serde(rename = "TLS_PSK_WITH_AES_128_CBC_SHA256")]
    PskAes128CbcSha256,

    #[strum(serialize = "TLS_PSK_WITH_AES_128_CBC_SHA")]
    #[serde(rename = "TLS_PSK_WITH_AES_128_CBC_SHA")]
    PskAes128CbcSha,

    #[strum(serialize = "TLS_PSK_WITH_3DES_EDE_CBC_SHA")]
    #[serde(rename = "TLS_PSK_WITH_3DES_EDE_CBC_SHA")]
    Psk3desEdeCbcSha,

    #[strum(serialize = "TLS_PSK_WITH_NULL_SHA256")]
    #[serde(rename = "TLS_PSK_WITH_NULL_SHA256")]
    PskNullSha256,

    #[strum(serialize = "TLS_PSK_WITH_NULL_SHA")]
    #[serde(rename = "TLS_PSK_WITH_NULL_SHA")]
    PskNullSha,
}

impl CipherSuite {
    /// Whether the suite provides no confidentiality
    pub fn is_null(&self) -> bool {
        matches!(self, CipherSuite::PskNullSha256 | CipherSuite::PskNullSha)
    }
}

/// Cipher suite policy.
///
/// The GlobalPlatform-mandated `TLS_PSK_WITH_AES_128_CBC_SHA256` is
/// always enabled; legacy and NULL suites are strictly opt-in, and
/// enabling NULL suites triggers warning banners at startup and per
/// connection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherPolicy {
    /// Enable `TLS_PSK_WITH_AES_128_CBC_SHA` and
    /// `TLS_PSK_WITH_3DES_EDE_CBC_SHA`
    #[serde(default)]
    pub enable_legacy: bool,

    /// Enable the unencrypted `TLS_PSK_WITH_NULL_*` suites
    #[serde(default)]
    pub enable_null: bool,
}

impl CipherPolicy {
    /// The enabled suite set, strongest first
    pub fn enabled_suites(&self) -> Vec<CipherSuite> {
        let mut suites = vec![CipherSuite::PskAes128CbcSha256];

        if self.enable_legacy {
            suites.push(CipherSuite::PskAes128CbcSha);
            suites.push(CipherSuite::Psk3desEdeCbcSha);
        }
        if self.enable_null {
            suites.push(CipherSuite::PskNullSha256);
            suites.push(CipherSuite::PskNullSha);
        }

        suites
    }
}

/// Key store backend selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KeyStoreConfig {
    /// YAML key file on disk
    File { path: PathBuf },
    /// Empty in-memory store (keys added through the API; tests)
    Memory,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("keys.yaml"),
        }
    }
}

/// Complete admin server configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Request path the card POSTs to
    pub admin_path: String,

    pub key_store: KeyStoreConfig,
    pub ciphers: CipherPolicy,

    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub closed_max_age_secs: u64,
    pub drain_timeout_secs: u64,

    pub mismatch_window_secs: u64,
    pub mismatch_threshold: usize,
    pub error_rate_window_secs: u64,
    pub error_rate_threshold: usize,

    pub correlator_retention_secs: u64,

    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8443,
            admin_path: "/admin".to_string(),
            key_store: KeyStoreConfig::default(),
            ciphers: CipherPolicy::default(),
            handshake_timeout_secs: 30,
            request_timeout_secs: 60,
            session_timeout_secs: 300,
            cleanup_interval_secs: 30,
            closed_max_age_secs: 3600,
            drain_timeout_secs: 10,
            mismatch_window_secs: 60,
            mismatch_threshold: 3,
            error_rate_window_secs: 300,
            error_rate_threshold: 10,
            correlator_retention_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration document
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ServerConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Format {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface mid-flight
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if !self.admin_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "admin_path must start with '/'".to_string(),
            ));
        }
        for (name, value) in [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("mismatch_window_secs", self.mismatch_window_secs),
            ("error_rate_window_secs", self.error_rate_window_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.mismatch_threshold == 0 || self.error_rate_threshold == 0 {
            return Err(ConfigError::Invalid(
                "thresholds must be at least 1".to_string(),
            ));
        }
        if let KeyStoreConfig::File { path } = &self.key_store {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "key store path cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Socket address to bind
    pub fn bind_endpoint(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Session store tuning derived from this configuration
    pub fn session_store_config(&self) -> SessionStoreConfig {
        SessionStoreConfig {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            closed_max_age: Duration::from_secs(self.closed_max_age_secs),
        }
    }

    /// Error engine tuning derived from this configuration
    pub fn error_engine_config(&self) -> ErrorEngineConfig {
        ErrorEngineConfig {
            mismatch_window: Duration::from_secs(self.mismatch_window_secs),
            mismatch_threshold: self.mismatch_threshold,
            error_rate_window: Duration::from_secs(self.error_rate_window_secs),
            error_rate_threshold: self.error_rate_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();

        assert_eq!(config.port, 8443);
        assert_eq!(config.bind_endpoint(), "0.0.0.0:8443");
    }

    #[test]
    fn cipher_policy_sets() {
        let policy = CipherPolicy::default();
        assert_eq!(
            policy.enabled_suites(),
            vec![CipherSuite::PskAes128CbcSha256]
        );

        let policy = CipherPolicy {
            enable_legacy: true,
            enable_null: true,
        };
        let suites = policy.enabled_suites();
        assert_eq!(suites.len(), 5);
        assert!(suites.iter().any(|s| s.is_null()));

        // Mandatory suite is always first
        assert_eq!(suites[0], CipherSuite::PskAes128CbcSha256);
    }

    #[test]
    fn suite_names() {
        assert_eq!(
            CipherSuite::PskAes128CbcSha256.to_string(),
            "TLS_PSK_WITH_AES_128_CBC_SHA256"
        );
        assert_eq!(
            CipherSuite::PskNullSha.to_string(),
            "TLS_PSK_WITH_NULL_SHA"
        );
    }

    #[test]
    fn load_partial_document() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            r#"
port: 9443
admin_path: /ota
key_store:
  backend: file
  path: /etc/ota/keys.yaml
ciphers:
  enable_null: true
"#,
        )?;

        let config = ServerConfig::load(&path)?;

        assert_eq!(config.port, 9443);
        assert_eq!(config.admin_path, "/ota");
        assert!(config.ciphers.enable_null);
        // Unspecified fields keep their defaults
        assert_eq!(config.session_timeout_secs, 300);

        Ok(())
    }

    #[test]
    fn invalid_rejected() {
        let mut config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.port = 8443;
        config.admin_path = "admin".to_string();
        assert!(config.validate().is_err());

        config.admin_path = "/admin".to_string();
        config.mismatch_threshold = 0;
        assert!(config.validate().is_err());
    }
}

// Copyright (c) 2022-2023 The MobileCoin Foundation

//! PSK-TLS server handshake layer
//!
//! Wraps accepted TCP streams in TLS 1.2 with PSK authentication. The
//! PSK identity is resolved through a [`KeyStore`] during the
//! handshake; cipher suites come from the configured [`CipherPolicy`].
//!
//! NULL suites carry no encryption and are opt-in only: enabling them
//! logs a banner at startup and every connection negotiating one is
//! flagged as unencrypted.
//!
//! Key material is copied straight into the TLS stack's PSK buffer and
//! never logged.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use scp81_ota_core::config::{CipherPolicy, CipherSuite};
use scp81_ota_core::keys::KeyStore;
use scp81_ota_core::session::TlsSessionInfo;

/// TLS alert codes surfaced in events and logs (RFC 5246 / RFC 4279)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TlsAlert {
    HandshakeFailure = 40,
    BadCertificate = 42,
    DecryptError = 51,
    ProtocolVersion = 70,
    InternalError = 80,
    UnknownPskIdentity = 115,
}

impl TlsAlert {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn description(&self) -> &'static str {
        match self {
            TlsAlert::HandshakeFailure => "handshake_failure",
            TlsAlert::BadCertificate => "bad_certificate",
            TlsAlert::DecryptError => "decrypt_error",
            TlsAlert::ProtocolVersion => "protocol_version",
            TlsAlert::InternalError => "internal_error",
            TlsAlert::UnknownPskIdentity => "unknown_psk_identity",
        }
    }
}

/// Handshake-scoped errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// Client presented an identity the key store does not know
    #[error("unknown PSK identity '{identity}'")]
    UnknownIdentity { identity: String },

    /// Handshake failed after identity resolution (wrong key, version
    /// mismatch, abort)
    #[error("TLS handshake failed: {message}")]
    Handshake {
        message: String,
        identity: Option<String>,
    },

    #[error("invalid cipher configuration: {0}")]
    CipherConfig(String),

    #[error("TLS stack error: {0}")]
    Stack(#[from] ErrorStack),
}

impl TlsError {
    /// Alert code reported for this failure
    pub fn alert(&self) -> TlsAlert {
        match self {
            TlsError::HandshakeTimeout(_) => TlsAlert::HandshakeFailure,
            TlsError::UnknownIdentity { .. } => TlsAlert::UnknownPskIdentity,
            TlsError::Handshake { message, .. } => map_message_to_alert(message),
            TlsError::CipherConfig(_) | TlsError::Stack(_) => TlsAlert::InternalError,
        }
    }

    /// Identity the client presented, when one was seen at all
    pub fn identity(&self) -> Option<&str> {
        match self {
            TlsError::UnknownIdentity { identity } => Some(identity),
            TlsError::Handshake { identity, .. } => identity.as_deref(),
            _ => None,
        }
    }
}

/// Map a handshake failure message onto the closest alert
fn map_message_to_alert(msg: &str) -> TlsAlert {
    let msg = msg.to_lowercase();

    if msg.contains("unknown psk") {
        TlsAlert::UnknownPskIdentity
    } else if msg.contains("decrypt") || msg.contains("mac") {
        TlsAlert::DecryptError
    } else if msg.contains("version") || msg.contains("protocol") {
        TlsAlert::ProtocolVersion
    } else if msg.contains("certificate") {
        TlsAlert::BadCertificate
    } else if msg.contains("handshake") || msg.contains("shutdown") || msg.contains("reset") {
        TlsAlert::HandshakeFailure
    } else {
        TlsAlert::InternalError
    }
}

/// Per-connection PSK state captured by the identity callback
#[derive(Clone, Debug, Default)]
struct PskState {
    identity: Option<String>,
    unknown: bool,
}

static PSK_STATE_INDEX: Lazy<Index<Ssl, PskState>> =
    Lazy::new(|| Ssl::new_ex_index().expect("ex data index"));

/// OpenSSL cipher name for an IANA suite
fn openssl_name(suite: CipherSuite) -> &'static str {
    match suite {
        CipherSuite::PskAes128CbcSha256 => "PSK-AES128-CBC-SHA256",
        CipherSuite::PskAes128CbcSha => "PSK-AES128-CBC-SHA",
        CipherSuite::Psk3desEdeCbcSha => "PSK-3DES-EDE-CBC-SHA",
        CipherSuite::PskNullSha256 => "PSK-NULL-SHA256",
        CipherSuite::PskNullSha => "PSK-NULL-SHA",
    }
}

/// Server-side PSK-TLS acceptor
pub struct TlsAcceptor {
    context: SslContext,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    /// Build an acceptor over the given key store and cipher policy.
    ///
    /// TLS 1.2 is pinned as both minimum and maximum version per SCP81.
    pub fn new(
        key_store: Arc<dyn KeyStore>,
        policy: CipherPolicy,
        handshake_timeout: Duration,
    ) -> Result<Self, TlsError> {
        if policy.enable_null {
            warn!("==============================================================");
            warn!("  NULL CIPHERS ENABLED - TRAFFIC WILL NOT BE ENCRYPTED");
            warn!("  For test use only");
            warn!("==============================================================");
        }

        let suites = policy.enabled_suites();
        let mut cipher_string = suites
            .iter()
            .map(|s| openssl_name(*s))
            .collect::<Vec<_>>()
            .join(":");

        // Legacy and NULL suites are refused at the default security
        // level
        if policy.enable_legacy || policy.enable_null {
            cipher_string.push_str("@SECLEVEL=0");
        }

        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;

        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;

        builder
            .set_cipher_list(&cipher_string)
            .map_err(|e| TlsError::CipherConfig(format!("'{cipher_string}': {e}")))?;

        builder.set_psk_server_callback(move |ssl, identity, psk_out| {
            psk_callback(&key_store, ssl, identity, psk_out)
        });

        info!(
            "TLS acceptor ready, ciphers: {:?}",
            suites.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );

        Ok(Self {
            context: builder.build(),
            handshake_timeout,
        })
    }

    /// Perform the server-side handshake on an accepted stream.
    ///
    /// On success returns the encrypted stream and the negotiated
    /// session parameters.
    pub async fn accept(
        &self,
        stream: TcpStream,
        client_endpoint: &str,
    ) -> Result<(SslStream<TcpStream>, TlsSessionInfo), TlsError> {
        let ssl = Ssl::new(&self.context)?;
        let mut stream = SslStream::new(ssl, stream).map_err(TlsError::Stack)?;

        let start = Instant::now();

        let result = tokio::time::timeout(
            self.handshake_timeout,
            Pin::new(&mut stream).accept(),
        )
        .await;

        let psk_state = stream
            .ssl()
            .ex_data(*PSK_STATE_INDEX)
            .cloned()
            .unwrap_or_default();

        match result {
            Err(_) => Err(TlsError::HandshakeTimeout(self.handshake_timeout)),
            Ok(Err(e)) if psk_state.unknown => {
                debug!("handshake failed on unknown identity: {e}");
                Err(TlsError::UnknownIdentity {
                    identity: psk_state.identity.unwrap_or_default(),
                })
            }
            Ok(Err(e)) => Err(TlsError::Handshake {
                message: e.to_string(),
                identity: psk_state.identity,
            }),
            Ok(Ok(())) => {
                let handshake_ms = start.elapsed().as_millis() as u64;

                let cipher = stream
                    .ssl()
                    .current_cipher()
                    .map(|c| c.standard_name().unwrap_or_else(|| c.name()).to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string());

                let identity = psk_state.identity.unwrap_or_else(|| "unknown".to_string());

                if cipher.to_uppercase().contains("NULL") {
                    warn!(
                        "UNENCRYPTED CONNECTION from {client_endpoint} (cipher: {cipher})"
                    );
                }

                info!(
                    "TLS handshake completed: client={client_endpoint}, cipher={cipher}, \
                     identity={identity}, duration={handshake_ms}ms"
                );

                Ok((
                    stream,
                    TlsSessionInfo::new(cipher, identity, handshake_ms, client_endpoint),
                ))
            }
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

/// PSK identity resolution callback.
///
/// The key bytes go straight into the TLS stack's output buffer; only
/// the identity is logged. Returning zero length fails the handshake.
fn psk_callback(
    key_store: &Arc<dyn KeyStore>,
    ssl: &mut openssl::ssl::SslRef,
    identity: Option<&[u8]>,
    psk_out: &mut [u8],
) -> Result<usize, ErrorStack> {
    // Non-UTF8 identities are reported hex-encoded
    let identity_str = match identity {
        Some(raw) => match std::str::from_utf8(raw) {
            Ok(s) => s.to_string(),
            Err(_) => {
                let hexed = hex::encode(raw);
                warn!("non-UTF8 PSK identity received: {hexed}");
                hexed
            }
        },
        None => {
            warn!("PSK callback received no identity");
            ssl.set_ex_data(
                *PSK_STATE_INDEX,
                PskState {
                    identity: None,
                    unknown: true,
                },
            );
            return Ok(0);
        }
    };

    debug!("PSK identity requested: {identity_str}");

    match key_store.get_key(&identity_str) {
        Some(key) => {
            let bytes = key.as_bytes();
            if bytes.len() > psk_out.len() {
                error!(
                    "PSK for '{identity_str}' exceeds the TLS stack buffer ({} > {})",
                    bytes.len(),
                    psk_out.len()
                );
                ssl.set_ex_data(
                    *PSK_STATE_INDEX,
                    PskState {
                        identity: Some(identity_str),
                        unknown: true,
                    },
                );
                return Ok(0);
            }

            psk_out[..bytes.len()].copy_from_slice(bytes);
            ssl.set_ex_data(
                *PSK_STATE_INDEX,
                PskState {
                    identity: Some(identity_str),
                    unknown: false,
                },
            );
            Ok(bytes.len())
        }
        None => {
            warn!("unknown PSK identity: {identity_str}");
            ssl.set_ex_data(
                *PSK_STATE_INDEX,
                PskState {
                    identity: Some(identity_str),
                    unknown: true,
                },
            );
            Ok(0)
        }
    }
}

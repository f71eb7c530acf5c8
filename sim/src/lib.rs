// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Card-side simulator for the SCP81 admin dialog
//!
//! Speaks only the wire protocol: PSK-TLS 1.2 client handshake and the
//! HTTP-POST command/response loop. Used by integration tests as the
//! counterparty to the admin server, and as a standalone probe via the
//! `scp81-card-sim` binary.

use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info};
use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Content type for both directions of the admin dialog
pub const CONTENT_TYPE_GP: &str = "application/vnd.globalplatform.card-content-mgt";

/// Card client errors
#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS stack error: {0}")]
    Stack(#[from] ErrorStack),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("server closed the connection")]
    Closed,

    #[error("response timeout")]
    Timeout,
}

/// Connection options for the simulated card
#[derive(Clone, Debug)]
pub struct CardOptions {
    /// PSK identity presented in the handshake
    pub identity: String,
    /// PSK key bytes
    pub key: Vec<u8>,
    /// Admin path to POST to
    pub admin_path: String,
    /// OpenSSL cipher list offered by the card
    pub cipher_list: String,
    /// Response read timeout
    pub timeout: Duration,
}

impl CardOptions {
    pub fn new(identity: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
            admin_path: "/admin".to_string(),
            cipher_list: "PSK-AES128-CBC-SHA256@SECLEVEL=0".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_admin_path(mut self, path: impl Into<String>) -> Self {
        self.admin_path = path.into();
        self
    }
}

/// One HTTP response from the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Summary of one complete card-side dialog
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DialogStats {
    /// Commands received from the server
    pub commands: usize,
    /// Responses posted back
    pub responses: usize,
}

fn client_context(options: &CardOptions) -> Result<SslContext, CardError> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_cipher_list(&options.cipher_list)?;

    let identity = options.identity.clone();
    let key = options.key.clone();

    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let id = identity.as_bytes();
        if id.len() + 1 > identity_out.len() || key.len() > psk_out.len() {
            return Ok(0);
        }
        identity_out[..id.len()].copy_from_slice(id);
        identity_out[id.len()] = 0;
        psk_out[..key.len()].copy_from_slice(&key);
        Ok(key.len())
    });

    Ok(builder.build())
}

/// A connected simulated card
pub struct CardClient {
    stream: SslStream<TcpStream>,
    options: CardOptions,
}

impl CardClient {
    /// Connect and complete the PSK-TLS handshake
    pub async fn connect(addr: &str, options: CardOptions) -> Result<Self, CardError> {
        debug!("connecting to {addr} as '{}'", options.identity);

        let tcp = TcpStream::connect(addr).await?;
        let ctx = client_context(&options)?;
        let ssl = Ssl::new(&ctx)?;
        let mut stream = SslStream::new(ssl, tcp)?;

        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| CardError::Handshake(e.to_string()))?;

        debug!(
            "handshake complete, cipher: {:?}",
            stream.ssl().current_cipher().map(|c| c.name())
        );

        Ok(Self { stream, options })
    }

    /// POST a body (card response APDUs, or empty for the initial hit)
    /// and read the server's answer
    pub async fn post(&mut self, body: &[u8]) -> Result<ServerResponse, CardError> {
        let head = format!(
            "POST {} HTTP/1.1\r\nHost: ota\r\nContent-Type: {CONTENT_TYPE_GP}\r\nContent-Length: {}\r\n\r\n",
            self.options.admin_path,
            body.len()
        );

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;

        tokio::time::timeout(self.options.timeout, self.read_response())
            .await
            .map_err(|_| CardError::Timeout)?
    }

    /// Run the whole dialog: initial empty POST, then answer every
    /// command through `respond` until the server sends `204`
    pub async fn run_dialog<F>(&mut self, mut respond: F) -> Result<DialogStats, CardError>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let mut stats = DialogStats::default();
        let mut response = self.post(&[]).await?;

        loop {
            match response.status {
                200 => {
                    stats.commands += 1;
                    let answer = respond(&response.body);
                    stats.responses += 1;
                    response = self.post(&answer).await?;
                }
                204 => {
                    info!(
                        "dialog complete: {} commands, {} responses",
                        stats.commands, stats.responses
                    );
                    return Ok(stats);
                }
                status => {
                    return Err(CardError::Malformed(format!(
                        "unexpected status {status}"
                    )))
                }
            }
        }
    }

    /// Drop the connection without closing TLS (simulates a reset)
    pub fn abort(self) {
        drop(self);
    }

    async fn read_response(&mut self) -> Result<ServerResponse, CardError> {
        let mut buffer = BytesMut::with_capacity(1024);

        let (status, header_len, content_length) = loop {
            let n = self.stream.read_buf(&mut buffer).await?;
            if n == 0 {
                return Err(CardError::Closed);
            }

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut parsed = httparse::Response::new(&mut headers);

            match parsed.parse(&buffer) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let status = parsed
                        .code
                        .ok_or_else(|| CardError::Malformed("missing status".to_string()))?;

                    let content_length = parsed
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);

                    break (status, header_len, content_length);
                }
                Ok(httparse::Status::Partial) => continue,
                Err(e) => return Err(CardError::Malformed(e.to_string())),
            }
        };

        let mut body = buffer[header_len..].to_vec();
        while body.len() < content_length {
            let mut chunk = vec![0u8; content_length - body.len()];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(CardError::Closed);
            }
            body.extend_from_slice(&chunk[..n]);
        }

        Ok(ServerResponse { status, body })
    }
}

/// Canned response behaviour: answer `9000` to everything
pub fn always_ok(_command: &[u8]) -> Vec<u8> {
    vec![0x90, 0x00]
}

/// Canned response behaviour yielding a fixed sequence of responses,
/// then `9000` forever
pub fn scripted(responses: Vec<Vec<u8>>) -> impl FnMut(&[u8]) -> Vec<u8> {
    let mut iter = responses.into_iter();
    move |_command| iter.next().unwrap_or_else(|| vec![0x90, 0x00])
}

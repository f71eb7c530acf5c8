// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Minimal HTTP/1.1 exchange for the SCP81 admin dialog
//!
//! The protocol surface is tiny: the card POSTs to one path over a
//! kept-alive connection and the server answers `200` with a command
//! body, `204` to end the session, or `400` with a short explanation.
//! Requests are parsed with `httparse`; responses are written directly.

use std::time::Duration;

use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Canonical SCP81 content type for both directions
pub const CONTENT_TYPE_GP: &str = "application/vnd.globalplatform.card-content-mgt";

/// Header block size cap
const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Body size cap (well above any concatenated APDU payload)
const MAX_BODY_BYTES: usize = 64 * 1024;

/// HTTP exchange errors
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Peer closed the connection before sending a request
    #[error("connection closed")]
    ConnectionClosed,

    /// Peer vanished mid-request
    #[error("connection interrupted mid-request")]
    Interrupted,

    #[error("read timeout")]
    Timeout,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request headers exceed {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,

    #[error("request body of {0} bytes exceeds {MAX_BODY_BYTES}")]
    BodyTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed admin request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Whether the declared content type is acceptable for an admin
    /// body.
    ///
    /// Accepts the canonical GlobalPlatform type (with or without
    /// parameters), the legacy `vnd.gpc` spelling, and plain octet
    /// streams. Empty bodies may omit the header entirely.
    pub fn has_admin_content_type(&self) -> bool {
        match &self.content_type {
            None => self.body.is_empty(),
            Some(ct) => {
                let ct = ct.trim().to_ascii_lowercase();
                ct.starts_with(CONTENT_TYPE_GP)
                    || ct.starts_with("application/vnd.gpc.card-content-mgt")
                    || ct.starts_with("application/octet-stream")
            }
        }
    }
}

/// Read one request from the stream, enforcing `timeout` over the whole
/// read
pub async fn read_request<S>(stream: &mut S, timeout: Duration) -> Result<Request, HttpError>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_request_inner(stream)).await {
        Ok(r) => r,
        Err(_) => Err(HttpError::Timeout),
    }
}

async fn read_request_inner<S>(stream: &mut S) -> Result<Request, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(1024);

    // Accumulate until the header block is complete
    let (mut request, header_len, content_length) = loop {
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(HttpError::HeadersTooLarge);
        }

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(HttpError::ConnectionClosed);
            }
            return Err(HttpError::Interrupted);
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Request::new(&mut headers);

        match parsed.parse(&buffer) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = parsed.method.unwrap_or_default().to_string();
                let path = parsed.path.unwrap_or_default().to_string();

                let mut content_type = None;
                let mut content_length = 0usize;

                for header in parsed.headers.iter() {
                    if header.name.eq_ignore_ascii_case("content-type") {
                        content_type =
                            Some(String::from_utf8_lossy(header.value).trim().to_string());
                    } else if header.name.eq_ignore_ascii_case("content-length") {
                        content_length = std::str::from_utf8(header.value)
                            .ok()
                            .and_then(|v| v.trim().parse().ok())
                            .ok_or_else(|| {
                                HttpError::Malformed("unparseable content-length".to_string())
                            })?;
                    }
                }

                break (
                    Request {
                        method,
                        path,
                        content_type,
                        body: Vec::new(),
                    },
                    header_len,
                    content_length,
                );
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(HttpError::Malformed(e.to_string())),
        }
    };

    if content_length > MAX_BODY_BYTES {
        return Err(HttpError::BodyTooLarge(content_length));
    }

    // Read the remainder of the body
    let mut body = buffer[header_len..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0u8; content_length - body.len()];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Interrupted);
        }
        body.extend_from_slice(&chunk[..n]);
    }

    if body.len() > content_length {
        // Pipelined bytes beyond the declared length are not expected
        // from any card
        return Err(HttpError::Malformed(
            "body exceeds declared content-length".to_string(),
        ));
    }

    trace!(
        "request: {} {} ({} body bytes)",
        request.method,
        request.path,
        body.len()
    );

    request.body = body;
    Ok(request)
}

/// Write a response with an optional body, keeping the connection open
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");

    // 204 carries neither body nor length
    if status != 204 {
        if let Some(ct) = content_type {
            head.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("Connection: keep-alive\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    if status != 204 && !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await?;

    Ok(())
}

/// Write a command script body (`200 OK`)
pub async fn write_commands<S>(stream: &mut S, body: &[u8]) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, 200, "OK", Some(CONTENT_TYPE_GP), body).await
}

/// Signal session completion (`204 No Content`)
pub async fn write_session_complete<S>(stream: &mut S) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    write_response(stream, 204, "No Content", None, &[]).await
}

/// Reject a malformed request (`400 Bad Request`)
pub async fn write_bad_request<S>(stream: &mut S, explanation: &str) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    write_response(
        stream,
        400,
        "Bad Request",
        Some("text/plain"),
        explanation.as_bytes(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn request_bytes(body: &[u8]) -> Vec<u8> {
        let mut req = format!(
            "POST /admin HTTP/1.1\r\nHost: test\r\nContent-Type: {CONTENT_TYPE_GP}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        req.extend_from_slice(body);
        req
    }

    #[tokio::test]
    async fn parse_post() {
        let raw = request_bytes(&hex::decode("9000").unwrap());
        let mut cursor = Cursor::new(raw);

        let req = read_request(&mut cursor, TIMEOUT).await.unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/admin");
        assert_eq!(req.body, hex::decode("9000").unwrap());
        assert!(req.has_admin_content_type());
    }

    #[tokio::test]
    async fn parse_empty_body() {
        let raw = b"POST /admin HTTP/1.1\r\nHost: test\r\nContent-Length: 0\r\n\r\n".to_vec();
        let mut cursor = Cursor::new(raw);

        let req = read_request(&mut cursor, TIMEOUT).await.unwrap();
        assert!(req.body.is_empty());
        assert!(req.has_admin_content_type());
    }

    #[tokio::test]
    async fn content_type_variants() {
        let accepted = [
            CONTENT_TYPE_GP.to_string(),
            format!("{CONTENT_TYPE_GP};version=1.0"),
            "application/vnd.gpc.card-content-mgt".to_string(),
            "application/octet-stream".to_string(),
        ];

        for ct in accepted {
            let req = Request {
                method: "POST".to_string(),
                path: "/admin".to_string(),
                content_type: Some(ct.clone()),
                body: vec![0x90, 0x00],
            };
            assert!(req.has_admin_content_type(), "should accept {ct}");
        }

        let req = Request {
            method: "POST".to_string(),
            path: "/admin".to_string(),
            content_type: Some("text/html".to_string()),
            body: vec![0x90, 0x00],
        };
        assert!(!req.has_admin_content_type());

        // A body without any content type is suspect
        let req = Request {
            method: "POST".to_string(),
            path: "/admin".to_string(),
            content_type: None,
            body: vec![0x90, 0x00],
        };
        assert!(!req.has_admin_content_type());
    }

    #[tokio::test]
    async fn closed_before_request() {
        let mut cursor = Cursor::new(Vec::new());
        let r = read_request(&mut cursor, TIMEOUT).await;
        assert!(matches!(r, Err(HttpError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn interrupted_mid_body() {
        let mut raw = request_bytes(&[0u8; 16]);
        raw.truncate(raw.len() - 8);
        let mut cursor = Cursor::new(raw);

        let r = read_request(&mut cursor, TIMEOUT).await;
        assert!(matches!(r, Err(HttpError::Interrupted)));
    }

    #[tokio::test]
    async fn malformed_rejected() {
        let mut cursor = Cursor::new(b"NOT AN HTTP REQUEST\r\n\r\n".to_vec());
        let r = read_request(&mut cursor, TIMEOUT).await;
        assert!(matches!(r, Err(HttpError::Malformed(_))));
    }

    #[tokio::test]
    async fn response_shapes() {
        let mut out = Vec::new();
        write_commands(&mut out, &hex::decode("00A4040000").unwrap())
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(&format!("Content-Type: {CONTENT_TYPE_GP}")));
        assert!(text.contains("Content-Length: 5"));

        let mut out = Vec::new();
        write_session_complete(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!text.contains("Content-Length"));

        let mut out = Vec::new();
        write_bad_request(&mut out, "no thanks").await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("no thanks"));
    }
}

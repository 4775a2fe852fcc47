//! HTTP/1.1 upgrade handshake.
//!
//! The client sends a GET with a random 16-byte key and accepts the
//! connection only if the server answers `101 Switching Protocols` with
//! the matching `Sec-WebSocket-Accept` value. There is no soft-fail.
//!
//! # Flow
//!
//! ```text
//! client                                   server
//!   │ GET /devtools/browser/.. HTTP/1.1       │
//!   │ Upgrade: websocket                      │
//!   │ Sec-WebSocket-Key: <base64 16 bytes>    │
//!   │────────────────────────────────────────►│
//!   │ HTTP/1.1 101 Switching Protocols        │
//!   │ Sec-WebSocket-Accept: <derived>         │
//!   │◄────────────────────────────────────────│
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the key before hashing.
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest response head accepted before the blank line.
pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Protocol version sent in the request.
const WEBSOCKET_VERSION: &str = "13";

// ============================================================================
// Key Derivation
// ============================================================================

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
#[must_use]
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Computes the `Sec-WebSocket-Accept` value for `key`.
#[must_use]
pub fn derive_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(ACCEPT_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// ============================================================================
// HandshakeRequest
// ============================================================================

/// Client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// `Host` header value, with the port when it is not the default.
    pub host: String,
    /// Request target: path plus query.
    pub path: String,
    /// The `Sec-WebSocket-Key` sent.
    pub key: String,
    /// Extra headers, in order.
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Builds a request for `url` with a freshly generated key.
    ///
    /// # Errors
    ///
    /// [`Error::Handshake`] if the URL has no host.
    pub fn new(url: &Url, headers: &[(String, String)]) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::handshake(format!("URL has no host: {url}")))?;

        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            path,
            key: generate_key(),
            headers: headers.to_vec(),
        })
    }

    /// Serializes the request head.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n",
            self.path, self.host, self.key
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

// ============================================================================
// HandshakeResponse
// ============================================================================

/// Parsed server response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    headers: FxHashMap<String, String>,
}

impl HandshakeResponse {
    /// Parses a response head from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the blank line terminating the head has
    /// arrived, otherwise the response and the number of bytes it used.
    ///
    /// # Errors
    ///
    /// [`Error::Handshake`] for a malformed status line or header, or a head
    /// larger than [`MAX_RESPONSE_HEAD`].
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(end) = find_head_end(buf) else {
            if buf.len() > MAX_RESPONSE_HEAD {
                return Err(Error::handshake("response head too large"));
            }
            return Ok(None);
        };
        if end > MAX_RESPONSE_HEAD {
            return Err(Error::handshake("response head too large"));
        }

        let head = std::str::from_utf8(&buf[..end - 4])
            .map_err(|_| Error::handshake("response head is not valid UTF-8"))?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if version != "HTTP/1.1" {
            return Err(Error::handshake(format!(
                "unexpected status line: {status_line:?}"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::handshake(format!("bad status code: {status_line:?}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = FxHashMap::<String, String>::default();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::handshake(format!("malformed header line: {line:?}")))?;
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        Ok(Some((
            Self {
                status,
                reason,
                headers,
            },
            end,
        )))
    }

    /// Returns a header value; names are case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Checks the response against the request that produced it.
    ///
    /// # Errors
    ///
    /// [`Error::Handshake`] naming the first failed check.
    pub fn validate(&self, request: &HandshakeRequest) -> Result<()> {
        if self.status != 101 {
            return Err(Error::handshake(format!(
                "expected status 101, got {} {}",
                self.status, self.reason
            )));
        }

        match self.header("upgrade") {
            Some(value) if value.eq_ignore_ascii_case("websocket") => {}
            other => {
                return Err(Error::handshake(format!(
                    "invalid Upgrade header: {other:?}"
                )));
            }
        }

        let connection_ok = self.header("connection").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        if !connection_ok {
            return Err(Error::handshake(format!(
                "invalid Connection header: {:?}",
                self.header("connection")
            )));
        }

        let expected = derive_accept(&request.key);
        if self.header("sec-websocket-accept") != Some(expected.as_str()) {
            return Err(Error::handshake("Sec-WebSocket-Accept mismatch"));
        }

        if let Some(extensions) = self.header("sec-websocket-extensions")
            && !extensions.trim().is_empty()
        {
            return Err(Error::handshake(format!(
                "server selected unrequested extensions: {extensions}"
            )));
        }

        Ok(())
    }
}

/// Index just past `\r\n\r\n`, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

// ============================================================================
// Exchange
// ============================================================================

/// Runs the handshake over `stream`, bounded by `limit`.
///
/// Returns the validated response and any bytes the server sent after the
/// head, which belong to the first frames.
///
/// # Errors
///
/// - [`Error::ConnectionTimeout`] if `limit` elapses
/// - [`Error::Handshake`] if the response is rejected
/// - [`Error::Connection`] if the stream closes mid-handshake
pub async fn perform<S>(
    stream: &mut S,
    request: &HandshakeRequest,
    limit: Duration,
) -> Result<(HandshakeResponse, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
    timeout(limit, exchange(stream, request))
        .await
        .map_err(|_| Error::connection_timeout(limit_ms))?
}

async fn exchange<S>(
    stream: &mut S,
    request: &HandshakeRequest,
) -> Result<(HandshakeResponse, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;
    trace!(host = %request.host, path = %request.path, "Upgrade request sent");

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((response, consumed)) = HandshakeResponse::parse(&buf)? {
            response.validate(request)?;
            let leftover = buf.split_off(consumed);
            debug!(
                status = response.status,
                leftover = leftover.len(),
                "Handshake accepted"
            );
            return Ok((response, leftover));
        }

        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(Error::connection("stream closed during handshake"));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

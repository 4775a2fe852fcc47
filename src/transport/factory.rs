//! Endpoint parsing and transport selection.
//!
//! One decision per connection attempt: try the WebSocket once, and if
//! that fails and the policy allows it, open the pipe source once. There
//! are no retries.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::options::ConnectOptions;

use super::pipe::PipeSource;
use super::{Connection, Transport, TransportEvents};

// ============================================================================
// FallbackPolicy
// ============================================================================

/// When a failed socket attempt may fall back to the pipe transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Any socket failure falls back.
    #[default]
    Always,
    /// Only an unsupported endpoint falls back; connectivity and handshake
    /// errors propagate.
    UnsupportedOnly,
}

impl FallbackPolicy {
    /// Returns `true` if `error` from the socket attempt permits fallback.
    #[inline]
    #[must_use]
    pub fn permits(self, error: &Error) -> bool {
        match self {
            Self::Always => true,
            Self::UnsupportedOnly => matches!(error, Error::Unsupported { .. }),
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A validated `ws://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parses an endpoint string.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the string is not a URL
    /// - [`Error::Unsupported`] for `wss://` (no TLS) or any other scheme
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        match url.scheme() {
            "ws" => {
                if url.host_str().is_none() {
                    return Err(Error::config(format!("endpoint has no host: {raw}")));
                }
                Ok(Self { url })
            }
            "wss" => Err(Error::unsupported("wss:// endpoints require TLS")),
            other => Err(Error::unsupported(format!(
                "no socket transport for scheme {other:?}"
            ))),
        }
    }

    /// Returns the endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the endpoint as a string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Connects to `endpoint`, falling back to `fallback` once when permitted.
///
/// # Errors
///
/// The socket error when no fallback is available or permitted, or the
/// pipe error when the fallback itself fails.
pub async fn select_transport(
    endpoint: &str,
    options: &ConnectOptions,
    fallback: Option<PipeSource>,
) -> Result<(Arc<dyn Transport>, TransportEvents)> {
    let attempt = match Endpoint::parse(endpoint) {
        Ok(endpoint) => Connection::connect(endpoint.as_str(), options).await,
        Err(e) => Err(e),
    };

    let socket_error = match attempt {
        Ok((connection, events)) => {
            info!(%endpoint, "Connected over WebSocket");
            return Ok((Arc::new(connection), events));
        }
        Err(e) => e,
    };

    match fallback {
        Some(source) if options.fallback.permits(&socket_error) => {
            warn!(%endpoint, error = %socket_error, "Socket transport failed, falling back to pipe");
            let (pipe, events) = source.open(options.max_message_size).await?;
            info!(%endpoint, "Connected over pipe");
            Ok((Arc::new(pipe), events))
        }
        Some(_) => {
            debug!(error = %socket_error, policy = ?options.fallback, "Fallback not permitted");
            Err(socket_error)
        }
        None => Err(socket_error),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::duplex;

    use crate::transport::TransportKind;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("ws://127.0.0.1:9222/devtools/browser/abc").expect("parse");
        assert_eq!(endpoint.url().port(), Some(9222));

        assert!(matches!(
            Endpoint::parse("wss://example.com/x"),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            Endpoint::parse("pipe:browser"),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(Endpoint::parse("not a url"), Err(Error::Url(_))));
    }

    #[test]
    fn test_policy_permits() {
        let unsupported = Error::unsupported("wss");
        let refused = Error::connection("refused");

        assert!(FallbackPolicy::Always.permits(&unsupported));
        assert!(FallbackPolicy::Always.permits(&refused));
        assert!(FallbackPolicy::UnsupportedOnly.permits(&unsupported));
        assert!(!FallbackPolicy::UnsupportedOnly.permits(&refused));
    }

    fn pipe_source() -> PipeSource {
        let (_browser_out, client_in) = duplex(1024);
        let (client_out, _browser_in) = duplex(1024);
        PipeSource::streams(client_in, client_out)
    }

    #[tokio::test]
    async fn test_unsupported_endpoint_falls_back() {
        let options = ConnectOptions::new().with_fallback(FallbackPolicy::UnsupportedOnly);
        let (transport, _events) = select_transport("wss://example.com/x", &options, Some(pipe_source()))
            .await
            .expect("fallback");
        assert_eq!(transport.kind(), TransportKind::Pipe);
    }

    #[tokio::test]
    async fn test_refused_socket_falls_back_when_always() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let options = ConnectOptions::new().with_handshake_timeout(Duration::from_secs(2));
        let endpoint = format!("ws://127.0.0.1:{port}/x");
        let (transport, _events) = select_transport(&endpoint, &options, Some(pipe_source()))
            .await
            .expect("fallback");
        assert_eq!(transport.kind(), TransportKind::Pipe);
    }

    #[tokio::test]
    async fn test_refused_socket_propagates_when_unsupported_only() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let options = ConnectOptions::new()
            .with_handshake_timeout(Duration::from_secs(2))
            .with_fallback(FallbackPolicy::UnsupportedOnly);
        let endpoint = format!("ws://127.0.0.1:{port}/x");
        let result = select_transport(&endpoint, &options, Some(pipe_source())).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_no_fallback_returns_socket_error() {
        let result = select_transport("wss://example.com/x", &ConnectOptions::default(), None).await;
        assert!(matches!(result, Err(Error::Unsupported { .. })));
    }
}

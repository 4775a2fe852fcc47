//! Connection configuration.
//!
//! Provides a type-safe interface for tuning the transport and the session
//! multiplexer: handshake and close timeouts, frame and message limits,
//! outgoing fragmentation, slow-motion delivery and the fallback policy.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use cdp_wire::ConnectOptions;
//!
//! let options = ConnectOptions::new()
//!     .with_handshake_timeout(Duration::from_secs(10))
//!     .with_slow_mo(Duration::from_millis(50))
//!     .with_header("Origin", "http://localhost");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::FallbackPolicy;

// ============================================================================
// Constants
// ============================================================================

/// Default bound on connection establishment.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for the peer's CLOSE after a locally initiated close.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on a single frame payload (256 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Default limit on a reassembled message (256 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

// ============================================================================
// ConnectOptions
// ============================================================================

/// Transport and multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bound on TCP connect plus the upgrade handshake.
    pub handshake_timeout: Duration,

    /// How long a local close waits for the peer's CLOSE.
    pub close_timeout: Duration,

    /// Largest accepted frame payload in bytes.
    pub max_frame_size: usize,

    /// Largest accepted reassembled message in bytes.
    pub max_message_size: usize,

    /// Split outgoing data messages into frames of this size.
    pub fragment_size: Option<usize>,

    /// Delay applied before each inbound message is routed.
    pub slow_mo: Duration,

    /// When the socket transport may fall back to the pipe transport.
    pub fallback: FallbackPolicy,

    /// Extra headers sent with the upgrade request.
    pub headers: Vec<(String, String)>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectOptions {
    /// Creates a new options instance with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_size: None,
            slow_mo: Duration::ZERO,
            fallback: FallbackPolicy::Always,
            headers: Vec::new(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectOptions {
    /// Sets the connection establishment timeout.
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the close handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the frame payload limit.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the reassembled message limit.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Fragments outgoing data messages into frames of `size` bytes.
    #[inline]
    #[must_use]
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = Some(size);
        self
    }

    /// Delays each inbound message by `delay` before routing.
    #[inline]
    #[must_use]
    pub fn with_slow_mo(mut self, delay: Duration) -> Self {
        self.slow_mo = delay;
        self
    }

    /// Sets the transport fallback policy.
    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Adds a header to the upgrade request.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectOptions {
    /// Validates the options configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a limit or timeout is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("handshake_timeout must be greater than zero"));
        }

        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(Error::config("size limits must be greater than zero"));
        }

        if self.max_frame_size > self.max_message_size {
            return Err(Error::config(format!(
                "max_frame_size ({}) exceeds max_message_size ({})",
                self.max_frame_size, self.max_message_size
            )));
        }

        if let Some(size) = self.fragment_size
            && size == 0
        {
            return Err(Error::config("fragment_size must be greater than zero"));
        }

        for (name, value) in &self.headers {
            if name.is_empty() || name.contains([':', '\r', '\n']) || value.contains(['\r', '\n']) {
                return Err(Error::config(format!("invalid handshake header: {name:?}")));
            }
        }

        Ok(())
    }

    /// Handshake timeout in milliseconds, for error reporting.
    #[inline]
    #[must_use]
    pub fn handshake_timeout_ms(&self) -> u64 {
        u64::try_from(self.handshake_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectOptions::default();
        assert_eq!(options.handshake_timeout, Duration::from_secs(30));
        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert_eq!(options.max_frame_size, 256 * 1024 * 1024);
        assert_eq!(options.fragment_size, None);
        assert_eq!(options.slow_mo, Duration::ZERO);
        assert_eq!(options.fallback, FallbackPolicy::Always);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = ConnectOptions::new()
            .with_fragment_size(1024)
            .with_slow_mo(Duration::from_millis(10))
            .with_fallback(FallbackPolicy::UnsupportedOnly)
            .with_header("Origin", "http://localhost");

        assert_eq!(options.fragment_size, Some(1024));
        assert_eq!(options.slow_mo, Duration::from_millis(10));
        assert_eq!(options.fallback, FallbackPolicy::UnsupportedOnly);
        assert_eq!(options.headers.len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_fragment() {
        let result = ConnectOptions::new().with_fragment_size(0).validate();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_header_injection() {
        let result = ConnectOptions::new()
            .with_header("X-Evil", "a\r\nHost: other")
            .validate();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_frame_above_message_limit() {
        let result = ConnectOptions::new()
            .with_max_frame_size(1024)
            .with_max_message_size(512)
            .validate();
        assert!(result.is_err());
    }
}

//! Error types for the CDP wire driver.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use cdp_wire::{Result, SessionMultiplexer};
//!
//! async fn example(mux: &SessionMultiplexer) -> Result<()> {
//!     let version = mux.root().call("Browser.getVersion", None).await?;
//!     println!("{version}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Scope |
//! |----------|----------|-------|
//! | Configuration | [`Error::Config`], [`Error::Unsupported`] | caller |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::NotOpen`] | fatal to the connection |
//! | Handshake | [`Error::Handshake`] | fatal to establishment |
//! | Framing | [`Error::Protocol`], [`Error::InvalidPayload`], [`Error::MessageTooBig`] | fatal, close cascade |
//! | Application | [`Error::Command`], [`Error::RequestTimeout`] | one pending command |
//! | Session | [`Error::SessionClosed`], [`Error::SessionNotFound`] | one session |
//! | Routing | [`Error::MalformedMessage`] | logged, message dropped |
//! | Teardown | [`Error::Dispose`] | recorded, teardown continues |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Url`] | varies |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::{CommandId, SessionId};
use crate::transport::ConnectionState;
use crate::wire::CloseCode;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when connection options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The endpoint asks for a transport this crate does not provide.
    #[error("Unsupported endpoint: {message}")]
    Unsupported {
        /// Description of what is unsupported.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport connection failed.
    ///
    /// Returned when the socket cannot be established or a read/write fails.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection establishment did not finish in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Send attempted while the connection is not open.
    #[error("Connection is not open (state: {state:?})")]
    NotOpen {
        /// State observed at the time of the call.
        state: ConnectionState,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Upgrade handshake was rejected or malformed.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Framing Errors
    // ========================================================================
    /// Wire framing violation.
    ///
    /// Fatal: the connection is closed with status 1002.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Payload data is inconsistent with the message type (bad UTF-8).
    ///
    /// Fatal: the connection is closed with status 1007.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of the invalid payload.
        message: String,
    },

    /// Frame or reassembled message exceeds the configured limit.
    ///
    /// Fatal: the connection is closed with status 1009.
    #[error("Message too big: {size} bytes (limit {limit})")]
    MessageTooBig {
        /// Size that was announced or accumulated.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    // ========================================================================
    // Application Errors
    // ========================================================================
    /// The remote side answered a command with an error payload.
    #[error("Protocol error ({method}): {message} (code {code})")]
    Command {
        /// Method of the failed command.
        method: String,
        /// Error code reported by the remote side.
        code: i64,
        /// Error message reported by the remote side.
        message: String,
    },

    /// A caller-layered timeout expired before the response arrived.
    #[error("Command {id} ({method}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The command id that timed out.
        id: CommandId,
        /// Method of the command.
        method: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// The session was closed before or while the command was pending.
    #[error("Protocol error ({method}): Session closed. Most likely the {target_type} has been closed.")]
    SessionClosed {
        /// Method of the rejected command.
        method: String,
        /// Type of the target behind the session.
        target_type: String,
    },

    /// No session with this id is attached.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The missing session id.
        session_id: SessionId,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// Inbound payload could not be classified as a response or an event.
    #[error("Malformed message: {message}")]
    MalformedMessage {
        /// Description of the problem.
        message: String,
    },

    // ========================================================================
    // Teardown Errors
    // ========================================================================
    /// A cleanup action failed during disposal.
    #[error("Dispose action failed: {message}")]
    Dispose {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unsupported-endpoint error.
    #[inline]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a not-open error.
    #[inline]
    pub fn not_open(state: ConnectionState) -> Self {
        Self::NotOpen { state }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid payload error.
    #[inline]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates a message-too-big error.
    #[inline]
    pub fn message_too_big(size: u64, limit: u64) -> Self {
        Self::MessageTooBig { size, limit }
    }

    /// Creates a command error from a remote error payload.
    #[inline]
    pub fn command(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Command {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(id: CommandId, method: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            id,
            method: method.into(),
            timeout_ms,
        }
    }

    /// Creates a session closed error.
    #[inline]
    pub fn session_closed(method: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self::SessionClosed {
            method: method.into(),
            target_type: target_type.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound { session_id }
    }

    /// Creates a malformed message error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Creates a dispose error.
    #[inline]
    pub fn dispose(message: impl Into<String>) -> Self {
        Self::Dispose {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::NotOpen { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if this error is a wire framing violation.
    #[inline]
    #[must_use]
    pub fn is_framing_error(&self) -> bool {
        self.close_code().is_some()
    }

    /// Returns `true` if this error tears down the whole connection.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.is_framing_error() || self.is_connection_error() || matches!(self, Self::Handshake { .. })
    }

    /// Close status code this error is reported with, for framing errors.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol { .. } => Some(CloseCode::Protocol),
            Self::InvalidPayload { .. } => Some(CloseCode::InvalidPayload),
            Self::MessageTooBig { .. } => Some(CloseCode::TooBig),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

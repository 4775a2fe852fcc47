//! Message transports.
//!
//! This module moves JSON text between the client and the browser. The
//! session layer sees only the [`Transport`] trait and a stream of
//! [`TransportEvent`]s, whatever carries the bytes underneath.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐                        ┌─────────────────┐
//! │ SessionMultiplexer  │   Arc<dyn Transport>   │  Browser        │
//! │                     │───────────────────────►│                 │
//! │  dispatch task      │◄───────────────────────│  ws://..        │
//! │                     │    TransportEvents     │  or fd pipe     │
//! └─────────────────────┘                        └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `select_transport` - Try the socket once, fall back to the pipe once
//! 2. `Connection` - Handshake, then `Open`
//! 3. `Transport::send` - Queue JSON text, resolved once written
//! 4. `TransportEvent::Closed` - Emitted exactly once on the way out
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | WebSocket connection and event loop |
//! | `pipe` | NUL-delimited pipe transport |
//! | `factory` | Endpoint parsing and transport selection |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and event loop.
pub mod connection;

/// Endpoint parsing and transport selection.
pub mod factory;

/// NUL-delimited pipe transport.
pub mod pipe;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::error::{Error, Result};
use crate::wire::CloseCode;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use factory::{Endpoint, FallbackPolicy, select_transport};
pub use pipe::{PipeSource, PipeTransport};

// ============================================================================
// Types
// ============================================================================

/// Receiving side of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending side of a transport's event stream.
pub(crate) type EventSender = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// Transport
// ============================================================================

/// Bidirectional message channel to the browser.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one JSON message. Resolves once the bytes are written.
    async fn send(&self, message: String) -> Result<()>;

    /// Closes the transport and waits until it is closed.
    async fn close(&self) -> Result<()>;

    /// Returns `true` while messages can be sent.
    fn is_open(&self) -> bool;

    /// Returns which transport this is.
    fn kind(&self) -> TransportKind;
}

/// Kind of transport in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket over TCP.
    WebSocket,
    /// NUL-delimited local pipe.
    Pipe,
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Notification from a transport, delivered in wire order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text message.
    Message(String),
    /// A fatal error; a `Closed` event follows.
    Error(Error),
    /// The transport closed. Emitted exactly once.
    Closed(CloseInfo),
}

/// How a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close status.
    pub code: CloseCode,
    /// Close reason.
    pub reason: String,
    /// `true` if the peer initiated or caused the close.
    pub remote: bool,
}

impl CloseInfo {
    /// Creates close information.
    #[inline]
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>, remote: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            remote,
        }
    }

    /// Close without a close frame (status 1006).
    #[inline]
    #[must_use]
    pub fn abnormal(reason: impl Into<String>, remote: bool) -> Self {
        Self::new(CloseCode::Abnormal, reason, remote)
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.remote { "remote" } else { "local" };
        write!(f, "{} {:?} ({side})", self.code, self.reason)
    }
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a transport. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Messages flow.
    Open,
    /// A close frame has been sent or received.
    Closing,
    /// Terminal.
    Closed,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Shared state and close outcome of one transport.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    close: watch::Sender<Option<CloseInfo>>,
}

impl Lifecycle {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        let (close, _) = watch::channel(None);
        Self { state, close }
    }

    #[inline]
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `next` if it is later than the current state.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            trace!(state = ?next, "Transport state changed");
        }
        moved
    }

    /// Enters `Closed` and records the close outcome.
    ///
    /// The state moves first so `closed()` waiters observe `Closed`.
    pub(crate) fn finish(&self, info: CloseInfo) {
        self.advance(ConnectionState::Closed);
        self.close.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(info);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn close_info(&self) -> Option<CloseInfo> {
        self.close.borrow().clone()
    }

    /// Waits until the transport is closed.
    pub(crate) async fn closed(&self) -> CloseInfo {
        let mut rx = self.close.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => info
                .clone()
                .unwrap_or_else(|| CloseInfo::abnormal("closed", false)),
            Err(_) => CloseInfo::abnormal("closed", false),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(ConnectionState::Connecting < ConnectionState::Open);
        assert!(ConnectionState::Open < ConnectionState::Closing);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::new(ConnectionState::Open);
        assert!(lifecycle.advance(ConnectionState::Closing));
        assert!(!lifecycle.advance(ConnectionState::Open));
        assert_eq!(lifecycle.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_lifecycle_finish_once() {
        let lifecycle = Lifecycle::new(ConnectionState::Open);
        lifecycle.finish(CloseInfo::new(CloseCode::Normal, "bye", false));
        lifecycle.finish(CloseInfo::abnormal("late", true));

        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        let info = lifecycle.closed().await;
        assert_eq!(info.code, CloseCode::Normal);
        assert_eq!(info.reason, "bye");
    }
}

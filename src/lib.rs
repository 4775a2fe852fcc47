//! cdp-wire - WebSocket transport and CDP session multiplexing.
//!
//! This library connects to a browser's DevTools endpoint and multiplexes
//! many CDP sessions over that single connection.
//!
//! # Architecture
//!
//! The crate is layered bottom-up:
//!
//! - **Wire**: RFC 6455 framing, close codes and the HTTP upgrade handshake
//! - **Transport**: a WebSocket [`Connection`] or a NUL-delimited pipe
//! - **Session**: [`SessionMultiplexer`] routes messages to [`CdpSession`]s
//!
//! Key design principles:
//!
//! - One event loop task owns each connection's socket
//! - Messages are routed in wire order by their `sessionId`
//! - Every pending command settles exactly once
//! - Teardown runs through a [`DisposableStack`] in reverse order
//!
//! # Quick Start
//!
//! ```no_run
//! use cdp_wire::{ConnectOptions, Result, SessionMultiplexer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = ConnectOptions::default();
//!     let mux = SessionMultiplexer::connect(
//!         "ws://127.0.0.1:9222/devtools/browser/id",
//!         &options,
//!         None,
//!     )
//!     .await?;
//!
//!     let targets = mux.root().call("Target.getTargets", None).await?;
//!     println!("{targets}");
//!
//!     mux.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`wire`] | Frame codec, close codes, handshake |
//! | [`transport`] | WebSocket and pipe transports |
//! | [`protocol`] | CDP message envelopes |
//! | [`session`] | Sessions and the multiplexer |
//! | [`dispose`] | Ordered cleanup |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`options`] | Connection options |

// ============================================================================
// Modules
// ============================================================================

/// Ordered cleanup of resources.
pub mod dispose;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for commands, sessions and targets.
pub mod identifiers;

/// Connection options.
pub mod options;

/// CDP message envelopes.
pub mod protocol;

/// CDP sessions and the multiplexer.
pub mod session;

/// Message transports.
pub mod transport;

/// WebSocket wire format.
pub mod wire;

// ============================================================================
// Re-exports
// ============================================================================

// Cleanup
pub use dispose::DisposableStack;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CommandId, SessionId, SubscriptionId, TargetId};

// Options
pub use options::ConnectOptions;

// Protocol types
pub use protocol::{Event, Incoming, Request, Response, TargetInfo};

// Session types
pub use session::{CdpSession, CommandHandle, EventStream, SessionMultiplexer, Subscription};

// Transport types
pub use transport::{
    CloseInfo, Connection, ConnectionState, FallbackPolicy, PipeSource, PipeTransport, Transport,
    TransportEvent, TransportEvents, TransportKind,
};

// Wire types
pub use wire::{CloseCode, FrameCodec, Message, OpCode, Role};

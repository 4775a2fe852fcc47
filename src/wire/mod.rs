//! WebSocket wire format.
//!
//! Pure encoding and decoding: nothing in this module performs I/O except
//! [`handshake::perform`], which drives the upgrade over a caller's stream.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame header layout, masking, validation |
//! | `close` | Close status registry and close payloads |
//! | `codec` | Message reassembly and outgoing fragmentation |
//! | `handshake` | Upgrade request, response parsing and validation |

// ============================================================================
// Submodules
// ============================================================================

/// Close status codes and payloads.
pub mod close;

/// Stateful message codec.
pub mod codec;

/// Frame encoding and decoding.
pub mod frame;

/// HTTP upgrade handshake.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::{CloseCode, CloseFrame};
pub use codec::{FrameCodec, Message};
pub use frame::{Decoded, Frame, FrameLimits, OpCode, Role, apply_mask, decode_frame, encode_frame};
pub use handshake::{HandshakeRequest, HandshakeResponse, derive_accept, generate_key};

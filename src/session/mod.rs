//! CDP sessions over a shared transport.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `callbacks` | Command id allocation and response correlation |
//! | `listeners` | Per-session event listeners |
//! | `cdp` | [`CdpSession`], one logical channel |
//! | `multiplexer` | [`SessionMultiplexer`], routing and lifecycle |

// ============================================================================
// Submodules
// ============================================================================

/// Command id allocation and response correlation.
pub mod callbacks;

/// One logical CDP channel.
pub mod cdp;

/// Per-session event listeners.
pub mod listeners;

/// Routing and session lifecycle.
pub mod multiplexer;

// ============================================================================
// Re-exports
// ============================================================================

pub use callbacks::{CallbackRegistry, CommandHandle, PendingInfo};
pub use cdp::{CdpSession, ROOT_TARGET_TYPE};
pub use listeners::{EventStream, Listener, ListenerRegistry, Subscription};
pub use multiplexer::SessionMultiplexer;

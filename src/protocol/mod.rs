//! Session protocol message types.
//!
//! This module defines the JSON envelopes exchanged with the browser.
//! Only the envelope is modeled; params and results stay as JSON values.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Client → Browser | Command request |
//! | `Response` | Browser → Client | Command result or error |
//! | `Event` | Browser → Client | Notification |
//!
//! # Command Naming
//!
//! Commands and events follow `Domain.method` format:
//!
//! - `Target.attachToTarget`
//! - `Page.navigate`
//! - `Runtime.consoleAPICalled`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `event` | Event, ParsedEvent and Incoming types |
//! | `request` | Request and Response types |

// ============================================================================
// Submodules
// ============================================================================

/// Event message types.
pub mod event;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::{Event, Incoming, ParsedEvent, TargetInfo};
pub use request::{Request, Response, ResponseError};

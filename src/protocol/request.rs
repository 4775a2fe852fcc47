//! Request and Response message types.
//!
//! Defines the command envelope sent to the browser and the response
//! envelope it answers with.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::{CommandId, SessionId};

// ============================================================================
// Request
// ============================================================================

/// A command request from the client to the browser.
///
/// # Format
///
/// ```json
/// {
///   "id": 1,
///   "method": "Domain.method",
///   "params": { ... },
///   "sessionId": "..."
/// }
/// ```
///
/// `sessionId` is omitted for commands on the root session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response.
    pub id: CommandId,

    /// Command name.
    pub method: String,

    /// Command arguments; `{}` when none are given.
    #[serde(default = "empty_object")]
    pub params: Value,

    /// Target session; absent for the root session.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Request {
    /// Creates a new request.
    ///
    /// `None` or `null` params serialize as `{}`.
    #[must_use]
    pub fn new(
        id: CommandId,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Self {
        let params = match params {
            None | Some(Value::Null) => empty_object(),
            Some(value) => value,
        };
        Self {
            id,
            method: method.into(),
            params,
            session_id,
        }
    }

    /// Serializes the envelope to JSON text.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// ============================================================================
// Response
// ============================================================================

/// A response from the browser.
///
/// # Format
///
/// Success:
/// ```json
/// { "id": 1, "result": { ... }, "sessionId": "..." }
/// ```
///
/// Error:
/// ```json
/// { "id": 1, "error": { "code": -32000, "message": "..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    /// Matches the request `id`.
    pub id: CommandId,

    /// Result data (if success).
    #[serde(default)]
    pub result: Option<Value>,

    /// Error payload (if error).
    #[serde(default)]
    pub error: Option<ResponseError>,

    /// Session the response belongs to.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Error payload of a failed command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
    /// Error code.
    #[serde(default)]
    pub code: i64,

    /// Human readable message.
    #[serde(default)]
    pub message: String,

    /// Additional detail, when present.
    #[serde(default)]
    pub data: Option<Value>,
}

impl Response {
    /// Extracts the result value, returning error if response was error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Command`] carrying `method` and the remote code.
    pub fn into_result(self, method: &str) -> Result<Value> {
        match self.error {
            None => Ok(self.result.unwrap_or_else(empty_object)),
            Some(error) => {
                let message = match error.data {
                    Some(Value::String(data)) => format!("{} {data}", error.message),
                    _ => error.message,
                };
                Err(Error::command(method, error.code, message))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

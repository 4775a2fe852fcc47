//! Event message types.
//!
//! Events are notifications sent by the browser, plus the session
//! lifecycle notifications the multiplexer synthesizes locally.
//!
//! # Lifecycle Events
//!
//! | Method | Parsed as |
//! |--------|-----------|
//! | `Target.attachedToTarget` | [`ParsedEvent::AttachedToTarget`] |
//! | `Target.detachedFromTarget` | [`ParsedEvent::DetachedFromTarget`] |
//! | `Target.targetCrashed` | [`ParsedEvent::TargetCrashed`] |
//! | anything else | [`ParsedEvent::Other`] |

// ============================================================================
// Imports
// ============================================================================

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TargetId};

use super::Response;

// ============================================================================
// Event Names
// ============================================================================

/// Browser event announcing a new target session.
pub const ATTACHED_TO_TARGET: &str = "Target.attachedToTarget";

/// Browser event announcing the end of a target session.
pub const DETACHED_FROM_TARGET: &str = "Target.detachedFromTarget";

/// Browser event announcing a crashed target.
pub const TARGET_CRASHED: &str = "Target.targetCrashed";

/// Local notification emitted when a child session is registered.
pub const SESSION_ATTACHED: &str = "sessionattached";

/// Local notification emitted when a child session is torn down.
pub const SESSION_DETACHED: &str = "sessiondetached";

/// Local notification emitted by a session as it closes.
pub const SESSION_DISCONNECTED: &str = "CDPSession.Disconnected";

// ============================================================================
// Event
// ============================================================================

/// An event notification.
///
/// # Format
///
/// ```json
/// {
///   "method": "Domain.eventName",
///   "params": { ... },
///   "sessionId": "..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name in `Domain.eventName` format.
    pub method: String,

    /// Event-specific data.
    #[serde(default)]
    pub params: Value,

    /// Session the event belongs to; absent for the root session.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Event {
    /// Creates a root-session event.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            session_id: None,
        }
    }

    /// Returns the domain name from the method.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let event = Event::new("Page.loadEventFired", json!({}));
    /// assert_eq!(event.domain(), "Page");
    /// ```
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }

    /// Returns the event name from the method.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let event = Event::new("Page.loadEventFired", json!({}));
    /// assert_eq!(event.event_name(), "loadEventFired");
    /// ```
    #[inline]
    #[must_use]
    pub fn event_name(&self) -> &str {
        self.method.split('.').nth(1).unwrap_or_default()
    }

    /// Deserializes the params into a typed structure.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if the params do not match `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.params)?)
    }

    /// Parses the event into a typed variant.
    #[must_use]
    pub fn parse(&self) -> ParsedEvent {
        match self.method.as_str() {
            ATTACHED_TO_TARGET => match self.params_as::<AttachedParams>() {
                Ok(params) => ParsedEvent::AttachedToTarget {
                    session_id: params.session_id,
                    target_info: params.target_info,
                    waiting_for_debugger: params.waiting_for_debugger,
                },
                Err(_) => ParsedEvent::Other,
            },

            DETACHED_FROM_TARGET => match self.get_string("sessionId") {
                Some(session_id) => ParsedEvent::DetachedFromTarget {
                    session_id: SessionId::new(session_id),
                    target_id: self.get_string("targetId").map(TargetId::new),
                },
                None => ParsedEvent::Other,
            },

            TARGET_CRASHED => ParsedEvent::TargetCrashed {
                target_id: TargetId::new(self.get_string("targetId").unwrap_or_default()),
                status: self.get_string("status").unwrap_or_default(),
            },

            _ => ParsedEvent::Other,
        }
    }

    /// Gets a string from params.
    #[inline]
    fn get_string(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

// ============================================================================
// TargetInfo
// ============================================================================

/// Description of a browser target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Target id.
    pub target_id: TargetId,

    /// Target type: `page`, `iframe`, `worker`, `service_worker`, ...
    #[serde(rename = "type")]
    pub target_type: String,

    /// Title, when known.
    #[serde(default)]
    pub title: String,

    /// URL, when known.
    #[serde(default)]
    pub url: String,

    /// Whether a client is attached.
    #[serde(default)]
    pub attached: bool,

    /// Target that opened this one.
    #[serde(default)]
    pub opener_id: Option<TargetId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedParams {
    session_id: SessionId,
    target_info: TargetInfo,
    #[serde(default)]
    waiting_for_debugger: bool,
}

// ============================================================================
// ParsedEvent
// ============================================================================

/// Parsed event types for the events routing depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// A child session was created.
    AttachedToTarget {
        /// New session id.
        session_id: SessionId,
        /// Target behind the session.
        target_info: TargetInfo,
        /// Whether the target is paused until told to run.
        waiting_for_debugger: bool,
    },

    /// A child session ended.
    DetachedFromTarget {
        /// Ended session id.
        session_id: SessionId,
        /// Target behind the session, when given.
        target_id: Option<TargetId>,
    },

    /// A target crashed.
    TargetCrashed {
        /// Crashed target.
        target_id: TargetId,
        /// Termination status.
        status: String,
    },

    /// Any other event.
    Other,
}

// ============================================================================
// Incoming
// ============================================================================

/// An inbound message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to a command.
    Response(Response),
    /// Notification.
    Event(Event),
}

impl Incoming {
    /// Classifies a text payload.
    ///
    /// A message with an `id` is a response; otherwise one with a `method`
    /// is an event.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the text is not JSON or a field has the wrong type
    /// - [`Error::MalformedMessage`] if it is neither a response nor an event
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let (is_response, is_event) = match &value {
            Value::Object(object) => (has_field(object, "id"), has_field(object, "method")),
            _ => return Err(Error::malformed("message is not a JSON object")),
        };

        if is_response {
            return Ok(Self::Response(serde_json::from_value(value)?));
        }
        if is_event {
            return Ok(Self::Event(serde_json::from_value(value)?));
        }
        Err(Error::malformed("message has neither id nor method"))
    }

    /// Session the message belongs to.
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Response(response) => response.session_id.as_ref(),
            Self::Event(event) => event.session_id.as_ref(),
        }
    }
}

fn has_field(object: &Map<String, Value>, key: &str) -> bool {
    object.get(key).is_some_and(|v| !v.is_null())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_domain_and_name() {
        let event = Event::new("Page.loadEventFired", json!({}));
        assert_eq!(event.domain(), "Page");
        assert_eq!(event.event_name(), "loadEventFired");
    }

    #[test]
    fn test_parse_attached() {
        let event = Event::new(
            ATTACHED_TO_TARGET,
            json!({
                "sessionId": "S1",
                "targetInfo": {"targetId": "T1", "type": "page", "title": "", "url": "about:blank", "attached": true},
                "waitingForDebugger": false
            }),
        );

        match event.parse() {
            ParsedEvent::AttachedToTarget {
                session_id,
                target_info,
                waiting_for_debugger,
            } => {
                assert_eq!(session_id.as_str(), "S1");
                assert_eq!(target_info.target_type, "page");
                assert_eq!(target_info.target_id.as_str(), "T1");
                assert!(!waiting_for_debugger);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_detached() {
        let event = Event::new(DETACHED_FROM_TARGET, json!({"sessionId": "S1", "targetId": "T1"}));
        assert_eq!(
            event.parse(),
            ParsedEvent::DetachedFromTarget {
                session_id: SessionId::new("S1"),
                target_id: Some(TargetId::new("T1")),
            }
        );
    }

    #[test]
    fn test_attached_without_target_info_is_other() {
        let event = Event::new(ATTACHED_TO_TARGET, json!({"sessionId": "S1"}));
        assert_eq!(event.parse(), ParsedEvent::Other);
    }

    #[test]
    fn test_params_as() {
        #[derive(Deserialize)]
        struct Console {
            level: String,
        }

        let event = Event::new("Log.entryAdded", json!({"level": "error"}));
        let parsed: Console = event.params_as().expect("typed params");
        assert_eq!(parsed.level, "error");
    }

    #[test]
    fn test_incoming_classification() {
        let response = Incoming::parse(r#"{"id": 1, "result": {}}"#).expect("parse");
        assert!(matches!(response, Incoming::Response(_)));

        let event = Incoming::parse(r#"{"method": "Page.frameNavigated", "params": {}, "sessionId": "S2"}"#)
            .expect("parse");
        assert_eq!(event.session_id(), Some(&SessionId::new("S2")));
        assert!(matches!(event, Incoming::Event(_)));
    }

    #[test]
    fn test_incoming_malformed() {
        assert!(matches!(
            Incoming::parse(r#"{"foo": 1}"#),
            Err(Error::MalformedMessage { .. })
        ));
        assert!(matches!(Incoming::parse("[1,2]"), Err(Error::MalformedMessage { .. })));
        assert!(matches!(Incoming::parse("{not json"), Err(Error::Json(_))));
    }
}

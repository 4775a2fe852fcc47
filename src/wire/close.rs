//! Close status codes and close frame payloads.
//!
//! | Code | Variant | On the wire |
//! |------|---------|-------------|
//! | 1000 | `Normal` | yes |
//! | 1001 | `GoingAway` | yes |
//! | 1002 | `Protocol` | yes |
//! | 1003 | `Unsupported` | yes |
//! | 1005 | `NoStatus` | never |
//! | 1006 | `Abnormal` | never |
//! | 1007 | `InvalidPayload` | yes |
//! | 1008 | `Policy` | yes |
//! | 1009 | `TooBig` | yes |
//! | 1010 | `Extension` | yes |
//! | 1011 | `Internal` | yes |
//! | 1012 | `Restart` | yes |
//! | 1013 | `TryAgain` | yes |
//! | 1014 | `BadGateway` | yes |
//! | 1015 | `TlsHandshake` | never |
//! | 3000-4999 | `Other` | yes |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest reason that fits a control frame next to the status code.
pub const MAX_REASON_LEN: usize = 123;

// ============================================================================
// CloseCode
// ============================================================================

/// Close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: purpose fulfilled.
    Normal,
    /// 1001: endpoint going away.
    GoingAway,
    /// 1002: protocol error.
    Protocol,
    /// 1003: unacceptable data type.
    Unsupported,
    /// 1005: no status code was present.
    NoStatus,
    /// 1006: closed without a close frame.
    Abnormal,
    /// 1007: payload inconsistent with message type.
    InvalidPayload,
    /// 1008: policy violation.
    Policy,
    /// 1009: message too big.
    TooBig,
    /// 1010: required extension missing.
    Extension,
    /// 1011: unexpected server condition.
    Internal,
    /// 1012: service restart.
    Restart,
    /// 1013: try again later.
    TryAgain,
    /// 1014: bad gateway.
    BadGateway,
    /// 1015: TLS handshake failure.
    TlsHandshake,
    /// Any other code.
    Other(u16),
}

impl CloseCode {
    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Protocol => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::Extension => 1010,
            Self::Internal => 1011,
            Self::Restart => 1012,
            Self::TryAgain => 1013,
            Self::BadGateway => 1014,
            Self::TlsHandshake => 1015,
            Self::Other(code) => code,
        }
    }

    /// Returns `false` for codes reserved for local reporting.
    #[inline]
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        !matches!(self, Self::NoStatus | Self::Abnormal | Self::TlsHandshake) && self.is_allowed_on_wire()
    }

    /// Returns `true` if a peer may legitimately send this code.
    #[must_use]
    pub const fn is_allowed_on_wire(self) -> bool {
        match self.as_u16() {
            1000..=1003 | 1007..=1014 => true,
            3000..=4999 => true,
            _ => false,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::Extension,
            1011 => Self::Internal,
            1012 => Self::Restart,
            1013 => Self::TryAgain,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

// ============================================================================
// CloseFrame
// ============================================================================

/// Status code and reason carried by a CLOSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code.
    pub code: CloseCode,
    /// UTF-8 reason, at most 123 bytes on the wire.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame.
    #[inline]
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses a CLOSE payload.
    ///
    /// An empty payload means no status was given and returns `None`.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for a 1-byte payload or a code not allowed on the wire
    /// - [`Error::InvalidPayload`] if the reason is not UTF-8
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::protocol("close payload of one byte")),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed_on_wire() {
                    return Err(Error::protocol(format!("invalid close code {code}")));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|e| Error::invalid_payload(format!("close reason: {e}")))?;
                Ok(Some(Self::new(code, reason)))
            }
        }
    }

    /// Encodes the payload. The reason is cut at a char boundary to fit.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let reason = truncate_reason(&self.reason);
        let mut out = BytesMut::with_capacity(2 + reason.len());
        out.put_u16(self.code.as_u16());
        out.put_slice(reason.as_bytes());
        out
    }
}

/// Longest prefix of `reason` within [`MAX_REASON_LEN`] bytes.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

// ============================================================================
// Tests
// ============================================================================

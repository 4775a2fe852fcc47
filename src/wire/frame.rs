//! Frame header encoding and decoding.
//!
//! Pure functions over byte buffers. Decoding never consumes input: the
//! caller advances its buffer by the reported `consumed` count.
//!
//! # Frame Layout
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     masking key (0 or 4)      |          payload ...          |
//! +-------------------------------+-------------------------------+
//! ```

// ============================================================================
// Imports
// ============================================================================

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest length expressed in the 7-bit field.
const SMALL_LEN: usize = 125;

/// Largest length expressed in the 16-bit extended field.
const MEDIUM_LEN: usize = 0xFFFF;

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

// ============================================================================
// OpCode
// ============================================================================

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text data.
    Text = 0x1,
    /// Binary data.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl OpCode {
    /// Parses an opcode nibble. Reserved values return `None`.
    #[inline]
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns `true` for CLOSE, PING and PONG.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }

    /// Returns `true` for CONTINUATION, TEXT and BINARY.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }
}

// ============================================================================
// Role
// ============================================================================

/// Which end of the connection a codec serves.
///
/// Clients mask everything they send and must receive unmasked frames;
/// servers do the inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connecting end.
    Client,
    /// Accepting end.
    Server,
}

impl Role {
    /// Whether frames sent by this role are masked.
    #[inline]
    #[must_use]
    pub const fn masks_outbound(self) -> bool {
        matches!(self, Self::Client)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded frame. The payload is stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Whether the frame arrived masked.
    pub masked: bool,
    /// Unmasked payload.
    pub payload: Bytes,
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame was available.
    Complete {
        /// The frame.
        frame: Frame,
        /// Bytes of input it occupied.
        consumed: usize,
    },
    /// More input is required.
    Incomplete {
        /// Minimum number of additional bytes before a retry can succeed.
        needed: usize,
    },
}

/// Validation limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Role of the decoding end.
    pub role: Role,
    /// Largest accepted payload.
    pub max_frame_size: usize,
}

// ============================================================================
// Encoding
// ============================================================================

/// Appends one frame to `dst`.
///
/// With `Some(mask)` the mask bit is set, the key follows the length and
/// the payload is XORed with it. Output is deterministic for a given key.
pub fn encode_frame(
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    dst: &mut BytesMut,
) {
    let len = payload.len();
    dst.reserve(header_len(len, mask.is_some()) + len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= FIN_BIT;
    }
    dst.put_u8(b0);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len <= SMALL_LEN {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= MEDIUM_LEN {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key, 0);
        }
        None => dst.put_slice(payload),
    }
}

/// Size of a frame header for a payload of `len` bytes.
#[inline]
#[must_use]
pub const fn header_len(len: usize, masked: bool) -> usize {
    let ext = if len <= SMALL_LEN {
        0
    } else if len <= MEDIUM_LEN {
        2
    } else {
        8
    };
    2 + ext + if masked { 4 } else { 0 }
}

/// XORs `bytes` in place with the repeating `key`.
///
/// `offset` is the position of `bytes[0]` within the full payload, so a
/// payload can be unmasked in pieces.
#[inline]
pub fn apply_mask(bytes: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= key[(offset + i) & 3];
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one frame from the front of `buf`.
///
/// # Errors
///
/// - [`Error::Protocol`] on reserved bits, reserved opcodes, fragmented or
///   oversized control frames, wrong masking for the role, or a 64-bit
///   length with the top bit set
/// - [`Error::MessageTooBig`] if the payload exceeds `limits.max_frame_size`
pub fn decode_frame(buf: &[u8], limits: &FrameLimits) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete {
            needed: 2 - buf.len(),
        });
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & FIN_BIT != 0;
    let rsv1 = b0 & RSV1_BIT != 0;
    let rsv2 = b0 & RSV2_BIT != 0;
    let rsv3 = b0 & RSV3_BIT != 0;

    if rsv1 || rsv2 || rsv3 {
        return Err(Error::protocol("reserved bits set without a negotiated extension"));
    }

    let raw_opcode = b0 & OPCODE_MASK;
    let opcode = OpCode::from_u8(raw_opcode)
        .ok_or_else(|| Error::protocol(format!("reserved opcode 0x{raw_opcode:X}")))?;

    let masked = b1 & MASK_BIT != 0;
    match limits.role {
        Role::Client if masked => {
            return Err(Error::protocol("server sent a masked frame"));
        }
        Role::Server if !masked => {
            return Err(Error::protocol("client sent an unmasked frame"));
        }
        _ => {}
    }

    let len7 = (b1 & LEN_MASK) as usize;

    if opcode.is_control() {
        if !fin {
            return Err(Error::protocol("fragmented control frame"));
        }
        if len7 > MAX_CONTROL_PAYLOAD {
            return Err(Error::protocol("control frame payload exceeds 125 bytes"));
        }
    }

    let (payload_len, mut pos) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete {
                    needed: 4 - buf.len(),
                });
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete {
                    needed: 10 - buf.len(),
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(Error::protocol("64-bit payload length has the top bit set"));
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    if payload_len > limits.max_frame_size as u64 {
        return Err(Error::message_too_big(
            payload_len,
            limits.max_frame_size as u64,
        ));
    }
    let payload_len = payload_len as usize;

    let mask = if masked {
        if buf.len() < pos + 4 {
            return Ok(Decoded::Incomplete {
                needed: pos + 4 - buf.len(),
            });
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    let total = pos.checked_add(payload_len).ok_or_else(|| {
        Error::message_too_big(payload_len as u64, limits.max_frame_size as u64)
    })?;
    if buf.len() < total {
        return Ok(Decoded::Incomplete {
            needed: total - buf.len(),
        });
    }

    let mut payload = BytesMut::from(&buf[pos..total]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key, 0);
    }

    Ok(Decoded::Complete {
        frame: Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload: payload.freeze(),
        },
        consumed: total,
    })
}

// ============================================================================
// Tests
// ============================================================================

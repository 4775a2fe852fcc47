//! Stateful message codec.
//!
//! [`FrameCodec`] turns a byte buffer into whole [`Message`]s, reassembling
//! fragmented data messages and letting control frames interleave. It also
//! encodes outgoing messages, masking them in the client role.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use super::close::CloseFrame;
use super::frame::{
    Decoded, Frame, FrameLimits, MAX_CONTROL_PAYLOAD, OpCode, Role, decode_frame, encode_frame,
};
use crate::error::{Error, Result};
use crate::options::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE};

// ============================================================================
// Message
// ============================================================================

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Binary data.
    Binary(Bytes),
    /// Ping with its application data.
    Ping(Bytes),
    /// Pong with its application data.
    Pong(Bytes),
    /// Close, with status when the peer gave one.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Returns `true` for PING, PONG and CLOSE.
    #[inline]
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close(_))
    }
}

// ============================================================================
// Internal State
// ============================================================================

/// Source of masking keys.
#[derive(Debug, Clone, Copy)]
enum MaskSource {
    Random,
    Fixed([u8; 4]),
}

/// Data message being reassembled.
#[derive(Debug)]
struct InFlight {
    opcode: OpCode,
    data: BytesMut,
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Message codec for one direction pair of a connection.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
    max_message_size: usize,
    mask: MaskSource,
    in_flight: Option<InFlight>,
}

impl FrameCodec {
    /// Creates a codec with default limits.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            mask: MaskSource::Random,
            in_flight: None,
        }
    }

    /// Sets the per-frame and per-message limits.
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, max_frame_size: usize, max_message_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self.max_message_size = max_message_size;
        self
    }

    /// Masks every outgoing frame with `key` instead of a random one.
    #[inline]
    #[must_use]
    pub fn with_mask_key(mut self, key: [u8; 4]) -> Self {
        self.mask = MaskSource::Fixed(key);
        self
    }

    /// Returns the codec's role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns `true` while a fragmented message is being reassembled.
    #[inline]
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drops any partially reassembled message.
    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decodes the next complete message from `buf`.
    ///
    /// Only whole frames are consumed. Returns `Ok(None)` when more bytes
    /// are needed; frames that only extend an in-flight message are
    /// consumed on the way.
    ///
    /// # Errors
    ///
    /// Any framing error from [`decode_frame`], plus:
    /// - [`Error::Protocol`] for a stray CONTINUATION or a new data frame
    ///   while a fragmented message is in flight
    /// - [`Error::MessageTooBig`] when reassembly exceeds the message limit
    /// - [`Error::InvalidPayload`] for text that is not UTF-8
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        let limits = FrameLimits {
            role: self.role,
            max_frame_size: self.max_frame_size,
        };

        loop {
            let (frame, consumed) = match decode_frame(buf, &limits)? {
                Decoded::Complete { frame, consumed } => (frame, consumed),
                Decoded::Incomplete { .. } => return Ok(None),
            };
            buf.advance(consumed);

            trace!(
                opcode = ?frame.opcode,
                fin = frame.fin,
                len = frame.payload.len(),
                "Frame decoded"
            );

            if let Some(message) = self.accept(frame)? {
                return Ok(Some(message));
            }
        }
    }

    /// Feeds one frame into the reassembly state.
    fn accept(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Close => Ok(Some(Message::Close(CloseFrame::parse(&frame.payload)?))),

            OpCode::Text | OpCode::Binary => {
                if self.in_flight.is_some() {
                    return Err(Error::protocol(
                        "new data frame while a fragmented message is in flight",
                    ));
                }
                self.check_size(frame.payload.len())?;

                if frame.fin {
                    return finish(frame.opcode, frame.payload).map(Some);
                }

                self.in_flight = Some(InFlight {
                    opcode: frame.opcode,
                    data: BytesMut::from(&frame.payload[..]),
                });
                Ok(None)
            }

            OpCode::Continuation => {
                let Some(in_flight) = self.in_flight.as_mut() else {
                    return Err(Error::protocol("continuation frame without a message in flight"));
                };

                let total = in_flight.data.len() + frame.payload.len();
                if total > self.max_message_size {
                    self.in_flight = None;
                    return Err(Error::message_too_big(
                        total as u64,
                        self.max_message_size as u64,
                    ));
                }
                in_flight.data.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                match self.in_flight.take() {
                    Some(done) => finish(done.opcode, done.data.freeze()).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(Error::message_too_big(
                size as u64,
                self.max_message_size as u64,
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Appends one frame to `dst`, masked according to the role.
    pub fn encode(&self, opcode: OpCode, payload: &[u8], fin: bool, dst: &mut BytesMut) {
        let mask = if self.role.masks_outbound() {
            Some(self.next_mask())
        } else {
            None
        };
        encode_frame(opcode, payload, fin, mask, dst);
    }

    /// Appends a whole message to `dst`.
    ///
    /// Data messages are split into frames of at most `fragment_size`
    /// bytes when given. Control messages are never fragmented.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if a PING or PONG payload exceeds 125 bytes.
    pub fn encode_message(
        &self,
        message: &Message,
        fragment_size: Option<usize>,
        dst: &mut BytesMut,
    ) -> Result<()> {
        match message {
            Message::Text(text) => {
                self.encode_data(OpCode::Text, text.as_bytes(), fragment_size, dst);
            }
            Message::Binary(data) => {
                self.encode_data(OpCode::Binary, data, fragment_size, dst);
            }
            Message::Ping(data) => {
                check_control_len(data.len())?;
                self.encode(OpCode::Ping, data, true, dst);
            }
            Message::Pong(data) => {
                check_control_len(data.len())?;
                self.encode(OpCode::Pong, data, true, dst);
            }
            Message::Close(frame) => {
                let payload = frame.as_ref().map(CloseFrame::encode).unwrap_or_default();
                self.encode(OpCode::Close, &payload, true, dst);
            }
        }
        Ok(())
    }

    fn encode_data(
        &self,
        opcode: OpCode,
        payload: &[u8],
        fragment_size: Option<usize>,
        dst: &mut BytesMut,
    ) {
        let size = match fragment_size {
            Some(size) if size > 0 && payload.len() > size => size,
            _ => {
                self.encode(opcode, payload, true, dst);
                return;
            }
        };

        let count = payload.len().div_ceil(size);
        for (i, chunk) in payload.chunks(size).enumerate() {
            let op = if i == 0 { opcode } else { OpCode::Continuation };
            self.encode(op, chunk, i + 1 == count, dst);
        }
    }

    fn next_mask(&self) -> [u8; 4] {
        match self.mask {
            MaskSource::Random => rand::random(),
            MaskSource::Fixed(key) => key,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Converts a reassembled payload into a message.
fn finish(opcode: OpCode, payload: Bytes) -> Result<Message> {
    match opcode {
        OpCode::Text => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| Error::invalid_payload(format!("text message: {e}")))?;
            Ok(Message::Text(text))
        }
        _ => Ok(Message::Binary(payload)),
    }
}

fn check_control_len(len: usize) -> Result<()> {
    if len > MAX_CONTROL_PAYLOAD {
        return Err(Error::protocol(format!(
            "control payload of {len} bytes exceeds 125"
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::wire::close::CloseCode;

    fn server() -> FrameCodec {
        FrameCodec::new(Role::Server)
    }

    fn client() -> FrameCodec {
        FrameCodec::new(Role::Client).with_mask_key([9, 8, 7, 6])
    }

    /// Frames written by a server, as a client would receive them.
    fn server_frames(frames: &[(OpCode, &[u8], bool)]) -> BytesMut {
        let codec = server();
        let mut buf = BytesMut::new();
        for (op, payload, fin) in frames {
            codec.encode(*op, payload, *fin, &mut buf);
        }
        buf
    }

    #[test]
    fn test_single_text_message() {
        let mut buf = server_frames(&[(OpCode::Text, b"{\"id\":1}", true)]);
        let message = client().decode(&mut buf).expect("decode");
        assert_eq!(message, Some(Message::Text("{\"id\":1}".into())));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_returns_none() {
        let full = server_frames(&[(OpCode::Text, b"hello world", true)]);
        let mut codec = client();

        let mut buf = BytesMut::from(&full[..5]);
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&full[5..]);
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Message::Text("hello world".into()))
        );
    }

    #[test]
    fn test_fragments_with_interleaved_ping() {
        let mut buf = server_frames(&[
            (OpCode::Text, b"Hel", false),
            (OpCode::Ping, b"p", true),
            (OpCode::Continuation, b"lo", true),
        ]);
        let mut codec = client();

        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Message::Ping(Bytes::from_static(b"p")))
        );
        assert!(codec.has_in_flight());
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Message::Text("Hello".into()))
        );
        assert!(!codec.has_in_flight());
    }

    #[test]
    fn test_stray_continuation_is_protocol_error() {
        let mut buf = server_frames(&[(OpCode::Continuation, b"x", true)]);
        assert!(matches!(
            client().decode(&mut buf),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_new_message_during_fragment_is_protocol_error() {
        let mut buf = server_frames(&[
            (OpCode::Text, b"a", false),
            (OpCode::Binary, b"b", true),
        ]);
        assert!(matches!(
            client().decode(&mut buf),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let mut buf = server_frames(&[(OpCode::Text, &[0xC3, 0x28], true)]);
        assert!(matches!(
            client().decode(&mut buf),
            Err(Error::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_utf8_split_across_fragments_is_valid() {
        let snowman = "\u{2603}".as_bytes();
        let mut buf = server_frames(&[
            (OpCode::Text, &snowman[..1], false),
            (OpCode::Continuation, &snowman[1..], true),
        ]);
        assert_eq!(
            client().decode(&mut buf).expect("decode"),
            Some(Message::Text("\u{2603}".into()))
        );
    }

    #[test]
    fn test_reassembly_limit() {
        let mut codec = client().with_limits(8, 8);
        let mut buf = server_frames(&[
            (OpCode::Binary, b"12345", false),
            (OpCode::Continuation, b"6789", true),
        ]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::MessageTooBig { size: 9, limit: 8 })
        ));
    }

    #[test]
    fn test_close_message() {
        let mut buf = BytesMut::new();
        server()
            .encode_message(
                &Message::Close(Some(CloseFrame::new(CloseCode::Normal, "done"))),
                None,
                &mut buf,
            )
            .expect("encode");

        let message = client().decode(&mut buf).expect("decode");
        assert_eq!(
            message,
            Some(Message::Close(Some(CloseFrame::new(CloseCode::Normal, "done"))))
        );
    }

    #[test]
    fn test_client_masks_and_server_decodes() {
        let mut buf = BytesMut::new();
        client()
            .encode_message(&Message::Text("ping".into()), None, &mut buf)
            .expect("encode");
        assert_eq!(buf[1] & 0x80, 0x80);

        let mut codec = server();
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(Message::Text("ping".into()))
        );
    }

    #[test]
    fn test_random_masks_differ() {
        let codec = FrameCodec::new(Role::Client);
        let keys: Vec<[u8; 4]> = (0..8).map(|_| codec.next_mask()).collect();
        assert!(keys.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_oversized_ping_rejected() {
        let mut buf = BytesMut::new();
        let result = client().encode_message(
            &Message::Ping(Bytes::from(vec![0u8; 126])),
            None,
            &mut buf,
        );
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_fragmented_text_reassembles(text in "\\PC{0,400}", size in 1usize..64) {
            let mut buf = BytesMut::new();
            client()
                .encode_message(&Message::Text(text.clone()), Some(size), &mut buf)
                .expect("encode");

            let mut codec = server();
            let decoded = codec.decode(&mut buf).expect("decode");
            prop_assert_eq!(decoded, Some(Message::Text(text)));
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_byte_at_a_time_delivery(data in proptest::collection::vec(any::<u8>(), 0..300), size in 1usize..50) {
            let mut wire = BytesMut::new();
            server()
                .encode_message(&Message::Binary(Bytes::from(data.clone())), Some(size), &mut wire)
                .expect("encode");

            let mut codec = client();
            let mut buf = BytesMut::new();
            let mut out = None;
            for byte in wire.iter() {
                buf.extend_from_slice(&[*byte]);
                if let Some(message) = codec.decode(&mut buf).expect("decode") {
                    out = Some(message);
                }
            }
            prop_assert_eq!(out, Some(Message::Binary(Bytes::from(data))));
        }
    }
}

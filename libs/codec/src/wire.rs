//! Frame Encoding and Decoding
//!
//! `encode` produces one complete frame; `try_decode` classifies the head of
//! a byte buffer as a complete frame, a frame still waiting on bytes, or
//! garbage. The decoder never reads past the buffer it was given and never
//! reports consuming more bytes than were present - callers rely on that to
//! drive stream reassembly from the same start offset across retries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{Channel, Message, MessageKind, Payload, PayloadShape};
use crate::MAX_PAYLOAD_LEN;

/// Outcome of a decode attempt at the head of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame was present; `consumed` bytes belong to it
    Complete { message: Message, consumed: usize },
    /// The buffer holds a valid prefix of a frame; retry with more bytes
    Incomplete,
    /// The buffer does not start with any known frame
    Invalid(CodecError),
}

/// Encode a message into a single wire frame.
///
/// Layout: 2-byte tag, then per [`PayloadShape`]: nothing, a 4-byte
/// big-endian length plus raw bytes (omitted entirely for an empty blob), or
/// a 1-byte channel id plus 4-byte big-endian length plus text bytes with no
/// NUL terminator.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(&message.kind.tag());

    match &message.payload {
        Payload::Empty => {}
        Payload::Blob(bytes) => {
            if !bytes.is_empty() {
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
        }
        Payload::Text { channel, text } => {
            buf.put_u8(channel.id());
            buf.put_u32(text.len() as u32);
            buf.put_slice(text.as_bytes());
        }
    }

    buf.freeze()
}

/// Attempt to decode one frame from the head of `buf`.
///
/// Guarantees: never reads beyond `buf`; `consumed` is only meaningful on
/// `Complete` and is never greater than `buf.len()`. Trailing bytes beyond a
/// complete frame are ignored (they belong to the next frame).
pub fn try_decode(buf: &[u8]) -> Decoded {
    if buf.len() < 2 {
        return Decoded::Incomplete;
    }

    let tag = [buf[0], buf[1]];
    let Some(kind) = MessageKind::from_tag(tag) else {
        return Decoded::Invalid(CodecError::UnknownTag(tag));
    };

    let body = &buf[2..];
    match kind.payload_shape() {
        PayloadShape::None => Decoded::Complete {
            message: Message::header_only(kind),
            consumed: 2,
        },
        PayloadShape::Blob => decode_blob(kind, body),
        PayloadShape::Text => decode_text(body),
    }
}

fn decode_blob(kind: MessageKind, body: &[u8]) -> Decoded {
    // A bare tag is a complete empty-payload control frame. These kinds only
    // travel over UDP where one datagram is one message, so the empty form
    // is unambiguous.
    if body.is_empty() {
        return Decoded::Complete {
            message: Message::header_only(kind),
            consumed: 2,
        };
    }
    if body.len() < 4 {
        return Decoded::Incomplete;
    }

    let declared = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Decoded::Invalid(CodecError::LengthOverflow {
            declared,
            cap: MAX_PAYLOAD_LEN,
        });
    }
    if body.len() < 4 + declared {
        return Decoded::Incomplete;
    }

    Decoded::Complete {
        message: Message::blob(kind, Bytes::copy_from_slice(&body[4..4 + declared])),
        consumed: 2 + 4 + declared,
    }
}

fn decode_text(body: &[u8]) -> Decoded {
    // 1-byte channel id + 4-byte length before any text
    if body.len() < 5 {
        return Decoded::Incomplete;
    }

    let channel = Channel::from_id(body[0]);
    let declared = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Decoded::Invalid(CodecError::LengthOverflow {
            declared,
            cap: MAX_PAYLOAD_LEN,
        });
    }
    if body.len() < 5 + declared {
        return Decoded::Incomplete;
    }

    // Engine TTY is 8-bit text; tolerate bytes outside ASCII by lossy
    // conversion rather than dropping the line.
    let text = String::from_utf8_lossy(&body[5..5 + declared]).into_owned();

    Decoded::Complete {
        message: Message::transmission(channel, text),
        consumed: 2 + 5 + declared,
    }
}

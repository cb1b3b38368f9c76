//! Wire Message Types
//!
//! The closed set of message kinds carried over the debug link, the two-byte
//! tag assigned to each, and the payload shapes they imply.
//!
//! Tag values are configuration data: [`TAG_TABLE`] is the single source of
//! truth mapping kind -> tag -> payload shape. Nothing in the parser matches
//! on raw byte literals, so reassigning a tag is a one-line edit here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message kind discriminator, one entry per wire frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Broadcast request asking devices on the subnet to announce themselves
    ServerAnnounce,
    /// Reply to an announce, carrying the device's identity payload
    ServerResponse,
    /// Connect handshake sent to a target's control port
    Connect,
    /// Disconnect handshake (sent multiple times, datagrams may be lost)
    Disconnect,
    /// Liveness probe
    Ping,
    /// Liveness probe reply, header-only (frame length is exactly 2)
    PingReply,
    /// TTY text line tagged with a logging channel
    Transmission,
}

/// How the bytes after the tag are to be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// No bytes follow the tag
    None,
    /// Optional 4-byte big-endian length prefix + raw bytes; a bare tag
    /// means an empty payload (only unambiguous where one datagram is one
    /// message, which is the only place these kinds travel)
    Blob,
    /// 1-byte channel id, 4-byte big-endian length, then that many text bytes
    Text,
}

/// Kind -> two-ASCII-byte tag -> payload shape.
///
/// Order is irrelevant; lookups scan the table both ways.
pub const TAG_TABLE: [(MessageKind, [u8; 2], PayloadShape); 7] = [
    (MessageKind::ServerAnnounce, *b"SA", PayloadShape::Blob),
    (MessageKind::ServerResponse, *b"SR", PayloadShape::Blob),
    (MessageKind::Connect, *b"CT", PayloadShape::Blob),
    (MessageKind::Disconnect, *b"DC", PayloadShape::Blob),
    (MessageKind::Ping, *b"PI", PayloadShape::None),
    (MessageKind::PingReply, *b"PR", PayloadShape::None),
    (MessageKind::Transmission, *b"TT", PayloadShape::Text),
];

impl MessageKind {
    /// Wire tag for this kind
    pub fn tag(self) -> [u8; 2] {
        TAG_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, tag, _)| *tag)
            .unwrap_or_else(|| unreachable!("every kind has a table entry"))
    }

    /// Payload shape implied by this kind
    pub fn payload_shape(self) -> PayloadShape {
        TAG_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, _, shape)| *shape)
            .unwrap_or_else(|| unreachable!("every kind has a table entry"))
    }

    /// Resolve a wire tag to a kind, `None` for unknown tags
    pub fn from_tag(tag: [u8; 2]) -> Option<Self> {
        TAG_TABLE
            .iter()
            .find(|(_, t, _)| *t == tag)
            .map(|(kind, _, _)| *kind)
    }
}

/// Logging channel carried in a transmission frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Debug,
    Remote,
    Mem,
    /// Any channel id this build does not recognize
    Unknown(u8),
}

impl Channel {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Channel::Debug,
            1 => Channel::Remote,
            2 => Channel::Mem,
            other => Channel::Unknown(other),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Channel::Debug => 0,
            Channel::Remote => 1,
            Channel::Mem => 2,
            Channel::Unknown(id) => id,
        }
    }

    /// Uppercase label used to tag TTY lines handed to the host
    pub fn name(self) -> &'static str {
        match self {
            Channel::Debug => "DEBUG",
            Channel::Remote => "REMOTE",
            Channel::Mem => "MEM",
            Channel::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Decoded payload, shape fully determined by the message kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    /// Raw length-prefixed bytes (announce/response/connect/disconnect)
    Blob(Bytes),
    /// Channel-tagged text line (transmission)
    Text { channel: Channel, text: String },
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Blob(bytes) => bytes.is_empty(),
            Payload::Text { text, .. } => text.is_empty(),
        }
    }
}

/// A complete wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Payload,
}

impl Message {
    /// Header-only message of the given kind
    pub fn header_only(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Payload::Empty,
        }
    }

    /// Blob-carrying control message
    pub fn blob(kind: MessageKind, bytes: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: Payload::Blob(bytes.into()),
        }
    }

    /// Channel-tagged transmission line
    pub fn transmission(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Transmission,
            payload: Payload::Text {
                channel,
                text: text.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_table_round_trips_every_kind() {
        for (kind, tag, _) in TAG_TABLE {
            assert_eq!(kind.tag(), tag);
            assert_eq!(MessageKind::from_tag(tag), Some(kind));
        }
    }

    #[test]
    fn tags_are_unique() {
        for (i, (_, a, _)) in TAG_TABLE.iter().enumerate() {
            for (_, b, _) in &TAG_TABLE[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn unknown_tag_resolves_to_none() {
        assert_eq!(MessageKind::from_tag(*b"ZZ"), None);
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::from_id(0).name(), "DEBUG");
        assert_eq!(Channel::from_id(1).name(), "REMOTE");
        assert_eq!(Channel::from_id(2).name(), "MEM");
        assert_eq!(Channel::from_id(200).name(), "UNKNOWN");
        assert_eq!(Channel::from_id(200).id(), 200);
    }
}

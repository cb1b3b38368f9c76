//! Targetlink Wire Protocol Codec
//!
//! Encoding and decoding rules for the debug-link wire protocol shared by the
//! UDP control path (one datagram = one message) and the TCP logging stream
//! (arbitrary packet boundaries, reassembled via [`ReassemblyBuffer`]).
//!
//! The protocol is a small closed set of type-tagged messages. Every frame
//! starts with a two-ASCII-byte tag; payload shape is fully determined by the
//! tag (see [`MessageKind`]). There is no schema negotiation and no
//! request/response correlation beyond a single in-flight ping per peer.

pub mod announce;
pub mod error;
pub mod message;
pub mod reassembly;
pub mod wire;

pub use announce::ServerAnnounce;
pub use error::CodecError;
pub use message::{Channel, Message, MessageKind, Payload};
pub use reassembly::{drain, ReassemblyBuffer};
pub use wire::{encode, try_decode, Decoded};

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Upper bound on any declared payload length. A desynchronized stream read
/// as a length field would otherwise stall reassembly waiting for gigabytes
/// that never arrive.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

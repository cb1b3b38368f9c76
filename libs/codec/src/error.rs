//! Codec Error Types
//!
//! Error taxonomy for wire protocol encoding and decoding. Note that an
//! incomplete frame is *not* an error - it is a first-class decode outcome
//! ([`crate::Decoded::Incomplete`]) because partial frames are the normal
//! state of a TCP stream.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The two-byte tag does not name any known message kind
    #[error("Unknown message tag: {0:#04x?}")]
    UnknownTag([u8; 2]),

    /// A fixed-size field was cut short (UDP datagram truncated in flight)
    #[error("Truncated {field}: needed {needed} bytes, had {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// Declared payload length exceeds the protocol cap
    #[error("Declared payload length {declared} exceeds cap {cap}")]
    LengthOverflow { declared: usize, cap: usize },

    /// TCP stream no longer starts on a frame boundary; the reassembly
    /// buffer has been dropped to resynchronize
    #[error("Stream desynchronized at unknown tag {0:#04x?}, buffer dropped")]
    StreamDesync([u8; 2]),

    /// Payload bytes are not valid for the field's expected text encoding
    #[error("Invalid text in {field}")]
    InvalidText { field: &'static str },

    /// Listen port field does not fit a TCP port
    #[error("Listen port {0} out of range")]
    PortOutOfRange(u32),
}

impl CodecError {
    pub(crate) fn truncated(field: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            field,
            needed,
            available,
        }
    }
}

//! TCP Stream Reassembly
//!
//! The logging stream arrives in arbitrary read-sized chunks; frames land
//! split across reads. [`ReassemblyBuffer`] owns the unconsumed tail of the
//! stream and [`drain`] pulls every complete frame off its head, so that the
//! buffer never retains a complete message between reads.

use bytes::BytesMut;
use tracing::warn;

use crate::error::CodecError;
use crate::message::Message;
use crate::wire::{try_decode, Decoded};

/// Growable byte buffer holding received-but-undecoded stream bytes.
///
/// Replaces raw offset arithmetic with two checked operations: `extend`
/// appends a read, `consume` discards a decoded frame from the head and
/// refuses to consume more than is present.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Append freshly received bytes at the tail
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discard `n` decoded bytes from the head.
    ///
    /// Returns an error instead of panicking if `n` exceeds the buffered
    /// length; that would mean a decoder reported consuming bytes it never
    /// saw, which the drain loop treats as a desync.
    pub fn consume(&mut self, n: usize) -> Result<(), CodecError> {
        if n > self.buf.len() {
            return Err(CodecError::truncated("consume", n, self.buf.len()));
        }
        let _ = self.buf.split_to(n);
        Ok(())
    }

    /// Drop everything buffered (stream desynchronized)
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Drain every complete frame from the head of `buffer`, handing each to
/// `sink` in arrival order. Returns the number of frames dispatched.
///
/// On an unknown tag the stream can no longer be framed: the whole buffer is
/// dropped and the desync reported. The caller logs and carries on; a corrupt
/// logging stream is a peer anomaly, never fatal to the manager.
pub fn drain<F>(buffer: &mut ReassemblyBuffer, mut sink: F) -> Result<usize, CodecError>
where
    F: FnMut(Message),
{
    let mut dispatched = 0;
    loop {
        match try_decode(buffer.as_slice()) {
            Decoded::Complete { message, consumed } => {
                buffer.consume(consumed)?;
                sink(message);
                dispatched += 1;
            }
            Decoded::Incomplete => return Ok(dispatched),
            Decoded::Invalid(err) => {
                warn!(dropped = buffer.len(), error = %err, "Dropping desynchronized stream buffer");
                let tag = match err {
                    CodecError::UnknownTag(tag) => tag,
                    _ => [0, 0],
                };
                buffer.clear();
                return Err(CodecError::StreamDesync(tag));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, MessageKind};
    use crate::wire::encode;
    use proptest::prelude::*;

    fn sample_stream() -> (Vec<u8>, Vec<Message>) {
        let messages = vec![
            Message::header_only(MessageKind::PingReply),
            Message::transmission(Channel::Remote, "hello"),
            Message::transmission(Channel::Debug, "a much longer line of engine output"),
            Message::header_only(MessageKind::PingReply),
            Message::transmission(Channel::Mem, "alloc 4096"),
        ];
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&encode(message));
        }
        (stream, messages)
    }

    #[test]
    fn whole_stream_in_one_feed() {
        let (stream, expected) = sample_stream();
        let mut buffer = ReassemblyBuffer::new();
        buffer.extend(&stream);

        let mut got = Vec::new();
        let n = drain(&mut buffer, |m| got.push(m)).unwrap();
        assert_eq!(n, expected.len());
        assert_eq!(got, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_one_shot() {
        let (stream, expected) = sample_stream();
        let mut buffer = ReassemblyBuffer::new();
        let mut got = Vec::new();
        for byte in &stream {
            buffer.extend(std::slice::from_ref(byte));
            drain(&mut buffer, |m| got.push(m)).unwrap();
        }
        assert_eq!(got, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_never_retains_a_complete_message() {
        let (stream, _) = sample_stream();
        let mut buffer = ReassemblyBuffer::new();
        for chunk in stream.chunks(3) {
            buffer.extend(chunk);
            drain(&mut buffer, |_| {}).unwrap();
            // After draining, whatever remains must not decode
            assert!(matches!(
                try_decode(buffer.as_slice()),
                Decoded::Incomplete
            ));
        }
    }

    #[test]
    fn desync_clears_buffer_and_reports_tag() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.extend(b"ZZ arbitrary trailing bytes");
        let mut fired = 0;
        let err = drain(&mut buffer, |_| fired += 1).unwrap_err();
        assert_eq!(err, CodecError::StreamDesync(*b"ZZ"));
        assert_eq!(fired, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn consume_beyond_length_is_rejected() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.extend(b"abc");
        assert!(buffer.consume(4).is_err());
        assert!(buffer.consume(3).is_ok());
        assert!(buffer.is_empty());
    }

    proptest! {
        /// Reassembly idempotence: splitting the stream at arbitrary offsets
        /// and feeding chunk by chunk yields the same dispatch sequence as
        /// feeding the whole stream at once.
        #[test]
        fn arbitrary_chunking_matches_one_shot(splits in proptest::collection::vec(0usize..200, 0..12)) {
            let (stream, expected) = sample_stream();

            let mut cuts: Vec<usize> = splits.iter().map(|s| s % (stream.len() + 1)).collect();
            cuts.push(0);
            cuts.push(stream.len());
            cuts.sort_unstable();
            cuts.dedup();

            let mut buffer = ReassemblyBuffer::new();
            let mut got = Vec::new();
            for window in cuts.windows(2) {
                buffer.extend(&stream[window[0]..window[1]]);
                drain(&mut buffer, |m| got.push(m)).unwrap();
            }
            prop_assert_eq!(got, expected);
            prop_assert!(buffer.is_empty());
        }
    }
}

//! Discovery Reply Payload
//!
//! A device answering a discovery broadcast embeds its identity in the
//! response blob: length-prefixed computer name, length-prefixed game name,
//! one-byte game type code, one-byte platform type code, and the TCP port
//! its logging stream listens on (4 bytes big-endian on the wire).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::CodecError;
use crate::Result;

/// Identity a device announces about itself during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAnnounce {
    pub computer_name: String,
    pub game_name: String,
    pub game_type: u8,
    pub platform_type: u8,
    pub listen_port: u16,
}

impl ServerAnnounce {
    /// Serialize into the response blob layout
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.computer_name.len() + self.game_name.len());
        write_string(&mut buf, &self.computer_name);
        write_string(&mut buf, &self.game_name);
        buf.push(self.game_type);
        buf.push(self.platform_type);
        // u32 on the wire even though ports fit in 16 bits
        buf.write_u32::<BigEndian>(self.listen_port as u32)
            .expect("vec write is infallible");
        buf
    }

    /// Parse a response blob, rejecting truncation and out-of-range ports
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(blob);
        let computer_name = read_string(&mut cursor, "computer name")?;
        let game_name = read_string(&mut cursor, "game name")?;
        let game_type = cursor
            .read_u8()
            .map_err(|_| CodecError::truncated("game type", 1, remaining(&cursor)))?;
        let platform_type = cursor
            .read_u8()
            .map_err(|_| CodecError::truncated("platform type", 1, remaining(&cursor)))?;
        let port = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| CodecError::truncated("listen port", 4, remaining(&cursor)))?;
        let listen_port =
            u16::try_from(port).map_err(|_| CodecError::PortOutOfRange(port))?;

        Ok(Self {
            computer_name,
            game_name,
            game_type,
            platform_type,
            listen_port,
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u32::<BigEndian>(s.len() as u32)
        .expect("vec write is infallible");
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<String> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| CodecError::truncated(field, 4, remaining(cursor)))? as usize;
    let available = remaining(cursor);
    if len > available {
        return Err(CodecError::truncated(field, len, available));
    }
    let start = cursor.position() as usize;
    let bytes = cursor.get_ref()[start..start + len].to_vec();
    cursor.set_position((start + len) as u64);
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidText { field })
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

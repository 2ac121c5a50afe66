//! Message framing.
//!
//! Every message starts with a 16 byte header made of two big-endian `u64`
//! copies of the payload length. The duplicate serves as a cheap integrity
//! check: a header whose two fields differ is rejected.

use byteorder::{BigEndian, ByteOrder};

use crate::{Error, Result};

pub const HEADER_LEN: usize = 16;

/// Chunk size used when streaming files.
pub const BUFFER_SIZE: usize = 1 << 16;

/// Upper bound on the size of a single text message.
pub const MAX_MESSAGE_LEN: u64 = 1 << 30;

pub fn encode_header(len: u64) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    BigEndian::write_u64(&mut header[..8], len);
    BigEndian::write_u64(&mut header[8..], len);
    header
}

/// Reads the payload length from a header.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<u64> {
    let first = BigEndian::read_u64(&header[..8]);
    let second = BigEndian::read_u64(&header[8..]);
    if first != second {
        return Err(Error::ResponseFormat(format!(
            "length fields of message header differ: {} != {}",
            first, second
        )));
    }
    Ok(first)
}

/// Encodes a complete frame, header followed by the UTF-8 payload.
pub fn encode(msg: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + msg.len());
    bytes.extend_from_slice(&encode_header(msg.len() as u64));
    bytes.extend_from_slice(msg.as_bytes());
    bytes
}

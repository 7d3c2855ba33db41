//! Length-prefixed framing and payload decoding primitives.
//!
//! Every message on the wire is a little-endian `u64` payload length followed
//! by exactly that many payload bytes. Payload bodies are encoded with
//! `bincode`'s legacy configuration (little-endian, fixed-width integers,
//! `u64` sequence lengths), prefixed by one or two hand-written discriminant
//! bytes; see the `message` module for the typed layer.

use std::error::Error;
use std::fmt;
use std::io;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single frame. A length prefix beyond this is treated as
/// corrupt framing and kills the connection rather than a 16-exabyte alloc.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// An error produced while decoding a received payload.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload ended before the expected fields were read.
    Truncated,
    /// The leading discriminant byte named no known message.
    UnknownTag(u8),
    /// The body after the discriminant did not parse.
    Payload(bincode::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "payload truncated"),
            DecodeError::UnknownTag(tag) => write!(f, "unknown message discriminant {}", tag),
            DecodeError::Payload(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

impl Error for DecodeError {}

impl From<bincode::Error> for DecodeError {
    fn from(e: bincode::Error) -> Self {
        DecodeError::Payload(e)
    }
}

/// Writes one frame: `u64` little-endian length, then the payload bytes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one frame. A short read or an implausible length prefix is an error;
/// the caller is expected to drop the connection.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Encodes a discriminant byte followed by a bincode body.
pub fn encode_tagged<T: Serialize>(tag: u8, body: &T) -> Vec<u8> {
    let mut payload = vec![tag];
    payload.extend(bincode::serialize(body).expect("message body is serializable"));
    payload
}

/// Splits a payload into its leading discriminant byte and the body bytes.
pub fn split_tag(payload: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    match payload.split_first() {
        Some((tag, body)) => Ok((*tag, body)),
        None => Err(DecodeError::Truncated),
    }
}

/// Decodes a bincode body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, DecodeError> {
    Ok(bincode::deserialize(body)?)
}

//! Discovery datagrams: 4-byte LE payload length, then the bincode-encoded message.
//!
//! One datagram carries exactly one message. The length prefix lets a receiver reject a
//! datagram that was cut short or has bytes after the message.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Stays under the UDP payload limit with room for headers.
pub const MAX_PAYLOAD_LEN: usize = 60 * 1024;

/// Encode `msg` as one datagram.
pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, DatagramEncodeError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DatagramEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("message of {0} bytes does not fit in a datagram")]
    TooLarge(usize),
}

/// Decode a whole datagram. The declared length must match the bytes received.
pub fn decode_datagram(datagram: &[u8]) -> Result<Message, DatagramDecodeError> {
    let (prefix, payload) = datagram
        .split_first_chunk::<LEN_SIZE>()
        .ok_or(DatagramDecodeError::Truncated {
            declared: LEN_SIZE,
            received: datagram.len(),
        })?;
    let declared = u32::from_le_bytes(*prefix) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(DatagramDecodeError::TooLarge(declared));
    }
    if payload.len() < declared {
        return Err(DatagramDecodeError::Truncated {
            declared,
            received: payload.len(),
        });
    }
    if payload.len() > declared {
        return Err(DatagramDecodeError::TrailingBytes(payload.len() - declared));
    }
    Ok(bincode::deserialize(payload)?)
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramDecodeError {
    #[error("datagram cut short: {received} of {declared} bytes")]
    Truncated { declared: usize, received: usize },
    #[error("{0} bytes after the message")]
    TrailingBytes(usize),
    #[error("declared length {0} exceeds the datagram limit")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

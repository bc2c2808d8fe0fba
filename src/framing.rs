//! Binary wire codecs for the control stream and the datagram channel.
//!
//! Two encodings, both pure functions over byte buffers:
//!
//! **Stream frame.** Every application message on the reliable control
//! stream is length-prefixed:
//! ```text
//! ┌──────────────┬─────────────────┐
//! │ length (u16) │ payload         │
//! │ big-endian   │ ≤ 65,535 bytes  │
//! └──────────────┴─────────────────┘
//! ```
//! The decoder is incremental: it extracts as many complete frames as the
//! buffer holds and returns the unconsumed tail. A partial header or a
//! truncated body stays in the tail; no partial frame is ever surfaced.
//!
//! **Awareness datagram.** Presence rides unreliable datagrams with a fixed
//! header and no length prefix (the datagram boundary is the transport's):
//! ```text
//! ┌────────────────┬────────────┬─────────────┐
//! │ client id (u32)│ clock (u32)│ state bytes │
//! │ big-endian     │ big-endian │ opaque      │
//! └────────────────┴────────────┴─────────────┘
//! ```

/// Stream-type marker written as the very first byte on the control stream,
/// before any frame, so the relay can dispatch the stream. `0x02` and `0x03`
/// are reserved for future multiplexing.
pub const STREAM_TYPE_SYNC: u8 = 0x01;

/// Maximum payload carried by a single stream frame.
pub const MAX_FRAME_PAYLOAD: usize = 65_535;

/// Size of the fixed awareness datagram header.
pub const DATAGRAM_HEADER_LEN: usize = 8;

/// Message-type tags: the first byte of every frame payload.
pub mod tag {
    /// Sync step 1: a state vector follows.
    pub const SYNC_STEP1: u8 = 0x00;
    /// Sync step 2: the updates the peer was missing follow.
    pub const SYNC_STEP2: u8 = 0x01;
    /// Incremental CRDT update.
    pub const UPDATE: u8 = 0x02;
    /// Awareness update.
    pub const AWARENESS: u8 = 0x03;
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Payload exceeds the 16-bit length prefix.
    FrameTooLarge { len: usize },
    /// Datagram shorter than the fixed header.
    DatagramTooShort { len: usize },
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { len } => {
                write!(f, "frame payload of {len} bytes exceeds the {MAX_FRAME_PAYLOAD}-byte limit")
            }
            Self::DatagramTooShort { len } => {
                write!(f, "datagram of {len} bytes is shorter than the {DATAGRAM_HEADER_LEN}-byte header")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Encode one payload as a length-prefixed stream frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FramingError::FrameTooLarge { len: payload.len() });
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Extract every complete frame from `buf`, returning the frames and the
/// unconsumed tail. Total on inputs of any length.
pub fn decode_frames(buf: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut offset = 0;
    while buf.len() - offset >= 2 {
        let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
        if buf.len() - offset - 2 < len {
            break;
        }
        frames.push(buf[offset + 2..offset + 2 + len].to_vec());
        offset += 2 + len;
    }
    (frames, buf[offset..].to_vec())
}

/// Encode an awareness datagram: fixed header plus opaque state bytes.
pub fn encode_awareness_datagram(client_id: u32, clock: u32, state: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_HEADER_LEN + state.len());
    out.extend_from_slice(&client_id.to_be_bytes());
    out.extend_from_slice(&clock.to_be_bytes());
    out.extend_from_slice(state);
    out
}

/// Decode an awareness datagram into `(client_id, clock, state)`.
pub fn decode_awareness_datagram(data: &[u8]) -> Result<(u32, u32, &[u8]), FramingError> {
    if data.len() < DATAGRAM_HEADER_LEN {
        return Err(FramingError::DatagramTooShort { len: data.len() });
    }
    let client_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let clock = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Ok((client_id, clock, &data[8..]))
}

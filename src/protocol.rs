//! Binary wire codec for the lanspeed discovery-and-transfer protocol.
//!
//! All integers are big-endian. Every message opens with a 4-byte magic
//! cookie and a 1-byte type tag. Validation failures are [`ProtocolError`]s
//! and carry no partial result: the receiving loop logs and discards the
//! datagram, it never treats a malformed message as fatal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Magic cookie opening every protocol message.
pub const MAGIC_COOKIE: u32 = 0xabcd_dcba;

/// Type tag for [`Message::Offer`].
pub const TYPE_OFFER: u8 = 0x2;
/// Type tag for [`Message::Request`].
pub const TYPE_REQUEST: u8 = 0x3;
/// Type tag for [`Message::Payload`].
pub const TYPE_PAYLOAD: u8 = 0x4;

/// Offer wire size: cookie + type + udp port + tcp port.
pub const OFFER_LEN: usize = 9;
/// Request wire size: cookie + type + file size.
pub const REQUEST_LEN: usize = 13;
/// Payload header size: cookie + type + total segments + segment index.
pub const PAYLOAD_HEADER_LEN: usize = 21;

/// Smallest prefix needed to read the cookie and type tag.
const PREFIX_LEN: usize = 5;

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// A message that failed wire-level validation.
///
/// Always non-fatal: callers log the error and keep their receive loop
/// running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too short: got {got} bytes, need at least {need}")]
    ShortBuffer { got: usize, need: usize },

    #[error("bad magic cookie 0x{0:08x}")]
    BadCookie(u32),

    #[error("unknown message type tag 0x{0:02x}")]
    UnknownType(u8),
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broadcast by the server to advertise its transfer ports.
    Offer { udp_port: u16, tcp_port: u16 },
    /// Sent by a client to start a UDP transfer of `file_size` bytes.
    Request { file_size: u64 },
    /// One segment of a UDP transfer, unicast back to the requester.
    Payload {
        total_segments: u64,
        segment_index: u64,
        payload: Bytes,
    },
}

impl Message {
    /// Encode the message into its fixed big-endian wire layout.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Offer { udp_port, tcp_port } => {
                let mut buf = BytesMut::with_capacity(OFFER_LEN);
                buf.put_u32(MAGIC_COOKIE);
                buf.put_u8(TYPE_OFFER);
                buf.put_u16(*udp_port);
                buf.put_u16(*tcp_port);
                buf.freeze()
            }
            Message::Request { file_size } => {
                let mut buf = BytesMut::with_capacity(REQUEST_LEN);
                buf.put_u32(MAGIC_COOKIE);
                buf.put_u8(TYPE_REQUEST);
                buf.put_u64(*file_size);
                buf.freeze()
            }
            Message::Payload {
                total_segments,
                segment_index,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_LEN + payload.len());
                buf.put_u32(MAGIC_COOKIE);
                buf.put_u8(TYPE_PAYLOAD);
                buf.put_u64(*total_segments);
                buf.put_u64(*segment_index);
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    /// Decode one datagram.
    ///
    /// Validates, in order: enough bytes for the cookie and type tag, the
    /// cookie itself, the type tag, and the per-type minimum length. No
    /// range validation of sizes or indices happens here.
    pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() < PREFIX_LEN {
            return Err(ProtocolError::ShortBuffer {
                got: data.len(),
                need: PREFIX_LEN,
            });
        }

        let mut buf = data;
        let cookie = buf.get_u32();
        if cookie != MAGIC_COOKIE {
            return Err(ProtocolError::BadCookie(cookie));
        }

        let tag = buf.get_u8();
        match tag {
            TYPE_OFFER => {
                if data.len() < OFFER_LEN {
                    return Err(ProtocolError::ShortBuffer {
                        got: data.len(),
                        need: OFFER_LEN,
                    });
                }
                Ok(Message::Offer {
                    udp_port: buf.get_u16(),
                    tcp_port: buf.get_u16(),
                })
            }
            TYPE_REQUEST => {
                if data.len() < REQUEST_LEN {
                    return Err(ProtocolError::ShortBuffer {
                        got: data.len(),
                        need: REQUEST_LEN,
                    });
                }
                Ok(Message::Request {
                    file_size: buf.get_u64(),
                })
            }
            TYPE_PAYLOAD => {
                if data.len() < PAYLOAD_HEADER_LEN {
                    return Err(ProtocolError::ShortBuffer {
                        got: data.len(),
                        need: PAYLOAD_HEADER_LEN,
                    });
                }
                let total_segments = buf.get_u64();
                let segment_index = buf.get_u64();
                Ok(Message::Payload {
                    total_segments,
                    segment_index,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Number of segments needed to carry `file_size` bytes in `segment_size`
/// chunks. Zero bytes take zero segments.
pub fn total_segments(file_size: u64, segment_size: u64) -> u64 {
    file_size.div_ceil(segment_size)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Packet boundary strategies.
//!
//! A [`Framing`] turns the raw bytes read from a socket into complete
//! application packets, and serializes outbound packets for the send queue.
//! The receive pipeline keeps a carry-over buffer per connection: every read
//! is appended to it, [`Framing::split`] takes the complete packets off the
//! front and leaves any trailing fragment in place for the next read.
//!
//! [`LengthPrefixed`] is the default strategy. Connections with a different
//! wire format supply their own implementation:
//!
//! ```ignore
//! struct Lines;
//!
//! impl Framing for Lines {
//!     type Packet = Bytes;
//!
//!     fn split(&self, buffer: &mut BytesMut) -> Result<Vec<Bytes>, FramingError> {
//!         let mut lines = Vec::new();
//!         while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
//!             let line = buffer.split_to(pos + 1);
//!             lines.push(line.freeze().slice(..pos));
//!         }
//!         Ok(lines)
//!     }
//!
//!     fn encode(&self, packet: &Bytes, dst: &mut BytesMut) -> Result<(), FramingError> {
//!         dst.extend_from_slice(packet);
//!         dst.extend_from_slice(b"\n");
//!         Ok(())
//!     }
//! }
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Errors raised while splitting or encoding packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// An inbound header announced a packet above the configured maximum.
    #[error("Inbound packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge {
        /// Length announced by the header.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An outbound payload cannot be described by the header.
    #[error("Outbound payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLong {
        /// Payload length.
        len: usize,
        /// Largest encodable payload.
        max: usize,
    },

    /// The byte stream violates the wire format.
    #[error("Malformed stream: {0}")]
    Malformed(String),
}

/// A strategy for splitting a byte stream into packets.
///
/// Implementations must be pure: all state between reads lives in the
/// buffer handed to [`split`](Self::split), never in `self`.
pub trait Framing: Send + Sync + 'static {
    /// The packet type produced by [`split`](Self::split).
    type Packet: Send + 'static;

    /// Remove every complete packet from the front of `buffer`.
    ///
    /// `buffer` holds the leftover of the previous call followed by the newly
    /// received bytes. Packets are returned in wire order; an incomplete
    /// trailing packet stays in `buffer`.
    fn split(&self, buffer: &mut BytesMut) -> Result<Vec<Self::Packet>, FramingError>;

    /// Append the wire form of `packet` to `dst`.
    fn encode(&self, packet: &Self::Packet, dst: &mut BytesMut) -> Result<(), FramingError>;
}

/// Width of the big-endian length header used by [`LengthPrefixed`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthWidth {
    /// One byte, payloads up to 255 bytes.
    #[default]
    U8,
    /// Two bytes, payloads up to 65535 bytes.
    U16,
    /// Four bytes.
    U32,
}

impl LengthWidth {
    /// Number of header bytes.
    pub fn header_len(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Largest length the header can carry.
    pub fn max_len(self) -> usize {
        match self {
            Self::U8 => u8::MAX as usize,
            Self::U16 => u16::MAX as usize,
            Self::U32 => u32::MAX as usize,
        }
    }

    fn peek(self, header: &[u8]) -> usize {
        match self {
            Self::U8 => header[0] as usize,
            Self::U16 => u16::from_be_bytes([header[0], header[1]]) as usize,
            Self::U32 => u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize,
        }
    }

    fn put(self, len: usize, dst: &mut BytesMut) {
        match self {
            Self::U8 => dst.put_u8(len as u8),
            Self::U16 => dst.put_u16(len as u16),
            Self::U32 => dst.put_u32(len as u32),
        }
    }
}

/// `[length][payload]` framing with a big-endian length header.
///
/// The header counts payload bytes only. Packets are the payloads, without
/// the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LengthPrefixed {
    width: LengthWidth,
    max_packet_size: usize,
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new(LengthWidth::U8)
    }
}

impl LengthPrefixed {
    /// Default upper bound on a single payload (16 MiB).
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

    /// Create a framing with the given header width.
    pub fn new(width: LengthWidth) -> Self {
        Self {
            width,
            max_packet_size: Self::DEFAULT_MAX_PACKET_SIZE.min(width.max_len()),
        }
    }

    /// Set the largest payload accepted in either direction.
    ///
    /// Values above what the header width can express are clamped.
    pub fn max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max.min(self.width.max_len());
        self
    }

    /// The header width.
    pub fn width(&self) -> LengthWidth {
        self.width
    }

    /// The largest payload accepted.
    pub fn max_len(&self) -> usize {
        self.max_packet_size
    }
}

impl Framing for LengthPrefixed {
    type Packet = Bytes;

    fn split(&self, buffer: &mut BytesMut) -> Result<Vec<Bytes>, FramingError> {
        let header_len = self.width.header_len();
        let mut packets = Vec::new();

        while buffer.len() >= header_len {
            let len = self.width.peek(&buffer[..header_len]);
            if len > self.max_packet_size {
                return Err(FramingError::PacketTooLarge {
                    len,
                    max: self.max_packet_size,
                });
            }

            // Partial packet: the buffer grows as the payload arrives.
            if buffer.len() < header_len + len {
                break;
            }

            buffer.advance(header_len);
            packets.push(buffer.split_to(len).freeze());
        }

        Ok(packets)
    }

    fn encode(&self, packet: &Bytes, dst: &mut BytesMut) -> Result<(), FramingError> {
        if packet.len() > self.max_packet_size {
            return Err(FramingError::PayloadTooLong {
                len: packet.len(),
                max: self.max_packet_size,
            });
        }

        dst.reserve(self.width.header_len() + packet.len());
        self.width.put(packet.len(), dst);
        dst.put_slice(packet);
        Ok(())
    }
}

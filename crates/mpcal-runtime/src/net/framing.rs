//! Length-prefixed frame codec shared by the mailbox and monitor protocols.
//!
//! Each frame is:
//!
//! ```text
//! +----------------------+------------------+
//! | Length (4 bytes, BE) | Payload          |
//! +----------------------+------------------+
//! ```
//!
//! There is no framing negotiation: a connection may be closed and
//! re-opened freely, and the first bytes on a fresh connection are a frame.
//! The decoder validates the length prefix against [`MAX_FRAME_SIZE`]
//! before allocating anything, so a crafted prefix cannot exhaust memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size accepted or produced (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Codec for [`tokio_util::codec::Framed`] streams carrying value payloads.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

fn oversized(len: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds limit {MAX_FRAME_SIZE}"),
    )
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(oversized(length));
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            // Reserve for the rest of the frame to reduce reallocations.
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(oversized(item.len()));
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

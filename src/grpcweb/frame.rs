//! Frame header and the trailer-in-body codec.
//!
//! Wire format:
//! ```text
//! ┌─────────────┬──────────────────┬──────────────────┐
//! │ Flags (1B)  │ Length (4B BE)   │ Payload          │
//! │ 0x80 = trl  │                  │ (Length bytes)   │
//! └─────────────┴──────────────────┴──────────────────┘
//! ```
//! Data frames share this layout with native length-prefixed messages, so a
//! data frame's bytes are valid in either framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::HeaderMap;
use tokio_util::codec::{Decoder, Encoder};

use super::error::{FrameError, Result};
use super::trailers::{encode_trailer_block, parse_trailer_block};

/// Frame header size: flags (1) + length (4).
pub const HEADER_SIZE: usize = 5;

/// Flag bit marking a trailer frame.
pub const TRAILER_FLAG: u8 = 0x80;

/// Flag bit marking a compressed message (carried through untouched).
pub const COMPRESSED_FLAG: u8 = 0x01;

/// Default bound on a single frame's payload: 16 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WebFrame {
    /// A message frame. `flags` never has [`TRAILER_FLAG`] set.
    Data { flags: u8, payload: Bytes },
    /// The terminal trailer frame, already parsed.
    Trailers(HeaderMap),
}

impl WebFrame {
    /// A message frame with no flags set.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        WebFrame::Data {
            flags: 0,
            payload: payload.into(),
        }
    }
}

/// Parsed 5-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: u8,
    pub len: usize,
}

impl FrameHeader {
    /// Peek a header at the start of `src` without consuming it.
    pub fn peek(src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        Some(Self { flags: src[0], len })
    }

    pub fn is_trailer(&self) -> bool {
        self.flags & TRAILER_FLAG != 0
    }
}

/// Append one frame to `dst`.
pub fn put_frame(flags: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(flags);
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Rebuild a data frame from a decoded flags byte and payload.
///
/// The payload must come from a decoded frame, so its length fits in `u32`.
pub fn reframe(flags: u8, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    dst.put_u8(flags & !TRAILER_FLAG);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    dst.freeze()
}

/// Encode a complete trailer frame.
pub fn encode_trailer_frame(trailers: &HeaderMap) -> Result<Bytes> {
    let block = encode_trailer_block(trailers);
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + block.len());
    put_frame(TRAILER_FLAG, &block, &mut dst)?;
    Ok(dst.freeze())
}

/// Streaming codec for web-framed bodies.
#[derive(Debug, Clone)]
pub struct WebFrameCodec {
    max_frame_len: usize,
}

impl WebFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for WebFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for WebFrameCodec {
    type Item = WebFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WebFrame>> {
        let Some(header) = FrameHeader::peek(src) else {
            return Ok(None);
        };
        if header.len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                len: header.len,
                max: self.max_frame_len,
            });
        }
        if src.len() < HEADER_SIZE + header.len {
            src.reserve(HEADER_SIZE + header.len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.len).freeze();

        if header.is_trailer() {
            Ok(Some(WebFrame::Trailers(parse_trailer_block(&payload)?)))
        } else {
            Ok(Some(WebFrame::Data {
                flags: header.flags,
                payload,
            }))
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WebFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<WebFrame> for WebFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: WebFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            WebFrame::Data { flags, payload } => put_frame(flags & !TRAILER_FLAG, &payload, dst),
            WebFrame::Trailers(trailers) => {
                put_frame(TRAILER_FLAG, &encode_trailer_block(&trailers), dst)
            }
        }
    }
}

//! Trailer-in-body ("web") framing.
//!
//! # Data Flow
//! ```text
//! Server side (trailers cannot travel as HTTP trailers):
//!     native response body (messages + HTTP trailers)
//!     → encode.rs (WebEncodeBody: data frames pass through, trailers → trailer frame)
//!     → HTTP/1.1-safe body
//!
//! Client side:
//!     web-framed response body
//!     → decode.rs (WebDecodeBody: frames → native messages, trailer frame → HTTP trailers)
//!     → native RPC stack
//! ```
//!
//! # Design Decisions
//! - Exactly one trailer frame terminates a stream; bytes after it are an error
//! - Frame payloads are bounded (`max_frame_len`) to cap buffering on hostile input
//! - Decoding errors keep everything decoded before them

pub mod decode;
pub mod encode;
pub mod error;
pub mod frame;
pub mod trailers;

pub use decode::{decode_messages, Decoded, WebDecodeBody};
pub use encode::{encode_messages, WebEncodeBody};
pub use error::{FrameError, PartialDecode};
pub use frame::{WebFrame, WebFrameCodec, DEFAULT_MAX_FRAME_LEN};

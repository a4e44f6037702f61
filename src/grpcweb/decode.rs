//! Web framing → native framing.

use std::mem;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame};
use tokio_util::codec::Decoder;

use super::error::{BoxError, FrameError, PartialDecode};
use super::frame::{reframe, WebFrame, WebFrameCodec};
use crate::observability::metrics;

/// Result of decoding a complete web-framed buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub messages: Vec<Bytes>,
    pub trailers: HeaderMap,
}

/// Decode a complete web-framed buffer into message payloads and trailers.
///
/// Zero frames is a valid, empty stream. Any failure keeps the messages
/// decoded before it.
pub fn decode_messages(input: &[u8], max_frame_len: usize) -> Result<Decoded, PartialDecode> {
    let mut codec = WebFrameCodec::new(max_frame_len);
    let mut buf = BytesMut::from(input);
    let mut messages = Vec::new();

    loop {
        let error = match codec.decode_eof(&mut buf) {
            Ok(Some(WebFrame::Data { payload, .. })) => {
                messages.push(payload);
                continue;
            }
            Ok(Some(WebFrame::Trailers(trailers))) if buf.is_empty() => {
                return Ok(Decoded { messages, trailers });
            }
            Ok(Some(WebFrame::Trailers(_))) => FrameError::ExtraData,
            Ok(None) if messages.is_empty() => return Ok(Decoded::default()),
            Ok(None) => FrameError::MissingTrailers,
            Err(e) => e,
        };
        return Err(PartialDecode { error, messages });
    }
}

enum State {
    Frames,
    /// Trailer frame seen; verifying nothing follows it.
    Draining(HeaderMap),
    Done,
}

/// Body adapter that turns a web-framed body into native framing.
///
/// Data frames are yielded as native length-prefixed messages in order. The
/// trailer frame is surfaced as the body's HTTP trailers once the inner body
/// has ended with nothing after it.
pub struct WebDecodeBody<B> {
    inner: B,
    codec: WebFrameCodec,
    buf: BytesMut,
    state: State,
    inner_done: bool,
    seen_frame: bool,
}

impl<B> WebDecodeBody<B> {
    pub fn new(inner: B, max_frame_len: usize) -> Self {
        Self {
            inner,
            codec: WebFrameCodec::new(max_frame_len),
            buf: BytesMut::new(),
            state: State::Frames,
            inner_done: false,
            seen_frame: false,
        }
    }

    fn fail(&mut self, error: FrameError) -> Poll<Option<Result<Frame<Bytes>, FrameError>>> {
        metrics::record_framing_error(error.reason());
        tracing::debug!(error = %error, "Web-framed body rejected");
        self.state = State::Done;
        Poll::Ready(Some(Err(error)))
    }
}

impl<B> Body for WebDecodeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = FrameError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, FrameError>>> {
        let this = self.get_mut();
        loop {
            match this.state {
                State::Done => return Poll::Ready(None),
                State::Draining(_) => {
                    if !this.buf.is_empty() {
                        return this.fail(FrameError::ExtraData);
                    }
                    if this.inner_done {
                        if let State::Draining(trailers) =
                            mem::replace(&mut this.state, State::Done)
                        {
                            metrics::record_frame_decoded("trailer");
                            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                        }
                        continue;
                    }
                }
                State::Frames => match this.codec.decode(&mut this.buf) {
                    Err(e) => return this.fail(e),
                    Ok(Some(WebFrame::Data { flags, payload })) => {
                        this.seen_frame = true;
                        metrics::record_frame_decoded("data");
                        return Poll::Ready(Some(Ok(Frame::data(reframe(flags, &payload)))));
                    }
                    Ok(Some(WebFrame::Trailers(trailers))) => {
                        this.state = State::Draining(trailers);
                        continue;
                    }
                    Ok(None) if this.inner_done => {
                        let error = if !this.buf.is_empty() {
                            FrameError::Truncated {
                                buffered: this.buf.len(),
                            }
                        } else if this.seen_frame {
                            FrameError::MissingTrailers
                        } else {
                            this.state = State::Done;
                            return Poll::Ready(None);
                        };
                        return this.fail(error);
                    }
                    Ok(None) => {}
                },
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    // Transport-level trailers are meaningless for web framing.
                    if let Ok(data) = frame.into_data() {
                        this.buf.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => return this.fail(FrameError::Body(e.into())),
                None => this.inner_done = true,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

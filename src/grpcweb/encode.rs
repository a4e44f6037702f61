//! Native framing → web framing.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame};

use super::error::{BoxError, FrameError, Result};
use super::frame::{encode_trailer_frame, put_frame};

/// Encode message payloads followed by one trailer frame.
pub fn encode_messages<I>(messages: I, trailers: &HeaderMap) -> Result<Bytes>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut dst = BytesMut::new();
    for message in messages {
        put_frame(0, message.as_ref(), &mut dst)?;
    }
    dst.extend_from_slice(&encode_trailer_frame(trailers)?);
    Ok(dst.freeze())
}

/// Body adapter that re-encodes a native response body with trailers in-band.
///
/// Native data frames pass through unchanged (their layout is identical in
/// both framings). HTTP trailers reported by the inner body are collected
/// and written as a single trailer frame once the inner body has finished.
pub struct WebEncodeBody<B> {
    inner: B,
    trailers: HeaderMap,
    finished: bool,
}

impl<B> WebEncodeBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            trailers: HeaderMap::new(),
            finished: false,
        }
    }

    /// Emit the terminal trailer frame. Errors are logged; the body has
    /// already been partially sent so there is nobody to report them to.
    fn finalize(&mut self) -> Option<Bytes> {
        self.finished = true;
        match encode_trailer_frame(&self.trailers) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write trailer frame");
                None
            }
        }
    }
}

impl<B> Body for WebEncodeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = FrameError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, FrameError>>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        if !data.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(data))));
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            merge(&mut this.trailers, trailers);
                        }
                    }
                },
                Some(Err(e)) => {
                    this.finished = true;
                    let e = e.into();
                    tracing::warn!(error = %e, "Response body failed before trailers");
                    return Poll::Ready(Some(Err(FrameError::Body(e))));
                }
                None => return Poll::Ready(this.finalize().map(|f| Ok(Frame::data(f)))),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }
}

fn merge(into: &mut HeaderMap, from: HeaderMap) {
    let mut last = None;
    for (name, value) in from {
        if let Some(name) = name {
            last = Some(name);
        }
        if let Some(name) = &last {
            into.append(name.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpcweb::decode::decode_messages;
    use crate::grpcweb::frame::{reframe, DEFAULT_MAX_FRAME_LEN, TRAILER_FLAG};
    use http::HeaderValue;
    use http_body_util::{BodyExt, StreamBody};
    use std::convert::Infallible;

    fn native_body(
        frames: Vec<Frame<Bytes>>,
    ) -> impl Body<Data = Bytes, Error = Infallible> + Unpin {
        StreamBody::new(futures_util::stream::iter(
            frames.into_iter().map(Ok::<_, Infallible>),
        ))
    }

    #[test]
    fn encodes_trailer_frame_last() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let encoded = encode_messages([&b"abc"[..]], &trailers).unwrap();

        assert_eq!(encoded[0], 0);
        assert_eq!(encoded[8], TRAILER_FLAG);
        assert!(encoded.ends_with(b"grpc-status: 0\r\n"));
    }

    #[tokio::test]
    async fn body_appends_trailer_frame() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("7"));
        trailers.insert("grpc-message", HeaderValue::from_static("denied"));

        let body = WebEncodeBody::new(native_body(vec![
            Frame::data(reframe(0, b"one")),
            Frame::data(reframe(0, b"two")),
            Frame::trailers(trailers.clone()),
        ]));
        let collected = body.collect().await.unwrap();
        assert!(collected.trailers().is_none());

        let decoded = decode_messages(&collected.to_bytes(), DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(
            decoded.messages,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(decoded.trailers, trailers);
    }

    #[tokio::test]
    async fn body_without_trailers_still_terminates() {
        let body = WebEncodeBody::new(native_body(vec![Frame::data(reframe(0, b"x"))]));
        let bytes = body.collect().await.unwrap().to_bytes();

        let decoded = decode_messages(&bytes, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(decoded.messages, vec![Bytes::from_static(b"x")]);
        assert!(decoded.trailers.is_empty());
    }
}

//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;
use tower::ServiceExt;

use grpc_downgrade::downgrade::{DowngradeHandler, MethodDescriptor, ServiceDescriptor};
use grpc_downgrade::net::alpn::{AlpnNegotiator, ServerTlsSettings};
use grpc_downgrade::net::listener::Listener;
use grpc_downgrade::net::tls::load_server_config;
use grpc_downgrade::{DowngradeServer, Shutdown};

pub const SAY: &str = "/echo.Echo/Say";
pub const FAIL: &str = "/echo.Echo/Fail";
pub const COLLECT: &str = "/echo.Echo/Collect";

/// Response header naming the HTTP version a request reached the server with.
pub const ARRIVED_AS: &str = "x-arrived-as";

/// Path to a file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Descriptors for the mock echo service.
pub fn echo_services() -> Vec<ServiceDescriptor> {
    vec![ServiceDescriptor::new("echo.Echo")
        .method(MethodDescriptor::unary("Say"))
        .method(MethodDescriptor::unary("Fail"))
        .method(MethodDescriptor::new("Collect", true, false))]
}

/// Prefix `payload` with a native frame header.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Payloads of every native frame in `bytes`.
pub fn unframe(mut bytes: Bytes) -> Vec<Bytes> {
    let mut messages = Vec::new();
    while bytes.len() >= 5 {
        bytes.advance(1);
        let len = bytes.get_u32() as usize;
        messages.push(bytes.split_to(len));
    }
    messages
}

fn status_trailers(code: &'static str, message: Option<&'static str>) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static(code));
    if let Some(message) = message {
        trailers.insert("grpc-message", HeaderValue::from_static(message));
    }
    trailers
}

/// Mock RPC server speaking native framing with HTTP trailers.
///
/// `Say` echoes its message prefixed with `echo: `; `Fail` answers
/// `NOT_FOUND`; everything else is `UNIMPLEMENTED`.
pub async fn echo_rpc(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let mut frames: Vec<Result<Frame<Bytes>, Infallible>> = Vec::new();
    let trailers = match path.as_str() {
        SAY => {
            for message in unframe(body) {
                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(&message);
                frames.push(Ok(Frame::data(frame(&reply))));
            }
            status_trailers("0", None)
        }
        FAIL => status_trailers("5", Some("no such thing")),
        _ => status_trailers("12", None),
    };
    frames.push(Ok(Frame::trailers(trailers)));

    let mut response = Response::new(Body::new(StreamBody::new(futures_util::stream::iter(frames))));
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    Ok(response)
}

/// Plain HTTP route next to the RPC service.
pub async fn health(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(Response::new(Body::from("ok")))
}

/// [`echo_rpc`] behind a downgrade handler, tagging each response with
/// [`ARRIVED_AS`].
pub fn downgrade_service() -> impl tower::Service<
    Request<Body>,
    Response = Response<Body>,
    Error = Infallible,
    Future = impl Future<Output = Result<Response<Body>, Infallible>> + Send,
> + Clone
       + Send
       + Sync
       + 'static {
    let handler = DowngradeHandler::new(tower::service_fn(echo_rpc), &echo_services())
        .with_fallback(tower::service_fn(health));
    tower::service_fn(move |req: Request<Body>| {
        let handler = handler.clone();
        async move {
            let version = format!("{:?}", req.version());
            let mut response = handler.oneshot(req).await?;
            response
                .headers_mut()
                .insert(ARRIVED_AS, HeaderValue::from_str(&version).unwrap());
            Ok::<_, Infallible>(response)
        }
    })
}

/// Start a plaintext downgrade server on an ephemeral port.
pub async fn start_downgrade_server() -> (SocketAddr, Shutdown) {
    start(DowngradeServer::new(downgrade_service())).await
}

/// Start a TLS downgrade server using the certificates in `tests/fixtures`.
pub async fn start_tls_downgrade_server() -> (SocketAddr, Shutdown) {
    let config = load_server_config(&fixture("server.pem"), &fixture("server.key")).unwrap();
    let server = DowngradeServer::new(downgrade_service())
        .with_tls(ServerTlsSettings::new(Arc::new(config)), &AlpnNegotiator::default());
    start(server).await
}

async fn start<S>(server: DowngradeServer<S>) -> (SocketAddr, Shutdown)
where
    S: tower::Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    let listener = Listener::bind("127.0.0.1:0", 64).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.run(listener, shutdown).await }
    });
    (addr, shutdown)
}

/// tonic codec carrying UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    type Encode = String;
    type Decode = String;
    type Encoder = Utf8Codec;
    type Decoder = Utf8Codec;

    fn encoder(&mut self) -> Self::Encoder {
        Utf8Codec
    }

    fn decoder(&mut self) -> Self::Decoder {
        Utf8Codec
    }
}

impl Encoder for Utf8Codec {
    type Item = String;
    type Error = Status;

    fn encode(&mut self, item: String, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

impl Decoder for Utf8Codec {
    type Item = String;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<String>, Status> {
        let bytes = src.copy_to_bytes(src.remaining());
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| Status::internal(e.to_string()))
    }
}

//! Reverse proxy used by the client-side downgrade proxy.
//!
//! # Responsibilities
//! - Director: point each request at the real endpoint, drop hop-by-hop
//!   headers, pin HTTP/1.1 and advertise both native and web responses
//! - Response post-processor: turn web-framed responses back into native
//!   framing with HTTP trailers populated
//! - Mark zero-length responses so they end the stream on headers
//!
//! # Design Decisions
//! - Request bodies are streamed through untouched; native and web data
//!   frames are byte-identical
//! - Upstream failures answer 502 with an `UNAVAILABLE` status

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http::header::{self, HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use http::uri::{Authority, InvalidUri, Scheme};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::downgrade::content_type::{self, RpcContentType};
use crate::grpcweb::error::BoxError;
use crate::grpcweb::WebDecodeBody;
use crate::net::transport::ForwardConnector;

/// Private marker for responses with no body. Never leaves the proxy.
pub const EMPTY_BODY_MARKER: HeaderName = HeaderName::from_static("x-grpc-downgrade-empty-body");

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::UPGRADE,
    header::TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
];

/// Forwards RPC requests to one endpoint, downgrading on the way out.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<ForwardConnector, Body>,
    scheme: Scheme,
    authority: Authority,
    max_frame_len: usize,
}

impl ReverseProxy {
    /// `endpoint` is `host:port`; `tls` selects the `https` scheme.
    pub fn new(
        connector: ForwardConnector,
        endpoint: &str,
        tls: bool,
        max_frame_len: usize,
    ) -> Result<Self, InvalidUri> {
        let authority = Authority::try_from(endpoint)?;
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            client,
            scheme: if tls { Scheme::HTTPS } else { Scheme::HTTP },
            authority,
            max_frame_len,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Rewrite `req` to target the real endpoint.
    pub fn direct<B>(&self, req: &mut Request<B>) {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        if let Ok(uri) = Uri::from_parts(parts) {
            *req.uri_mut() = uri;
        }
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(header::HOST);
        let subtype = RpcContentType::from_headers(headers).and_then(|ct| ct.subtype);
        headers.insert(header::ACCEPT, content_type::accept_both(subtype.as_deref()));
    }

    /// Convert an upstream response into what a native RPC client expects.
    pub fn modify_response<B>(&self, response: Response<B>) -> Response<Body>
    where
        B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let empty = http_body::Body::is_end_stream(&body) || has_zero_length(&parts.headers);
        if empty {
            parts.headers.insert(EMPTY_BODY_MARKER, HeaderValue::from_static("1"));
        }

        let web = RpcContentType::from_headers(&parts.headers).filter(RpcContentType::is_web);
        let Some(web) = web else {
            return Response::from_parts(parts, Body::new(body));
        };

        parts
            .headers
            .insert(CONTENT_TYPE, web.to_native().header_value());
        parts.headers.remove(CONTENT_LENGTH);
        tracing::trace!(content_type = %web, "Decoding web-framed response");
        let body = if empty {
            Body::empty()
        } else {
            Body::new(WebDecodeBody::new(body, self.max_frame_len))
        };
        Response::from_parts(parts, body)
    }

    /// Proxy one request.
    pub async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        self.direct(&mut req);
        let path = req.uri().path().to_string();
        match self.client.request(req).await {
            Ok(response) => {
                tracing::debug!(path, status = %response.status(), "Upstream responded");
                finalize_response(self.modify_response(response))
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.authority,
                    path,
                    error = %e,
                    "Upstream request failed"
                );
                bad_gateway()
            }
        }
    }
}

impl tower::Service<Request<Body>> for ReverseProxy {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}

/// Strip the empty-body marker; a marked response goes out with no body so
/// its headers end the stream.
pub fn finalize_response(response: Response<Body>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    if parts.headers.remove(EMPTY_BODY_MARKER).is_some() {
        return Response::from_parts(parts, Body::empty());
    }
    Response::from_parts(parts, body)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

fn has_zero_length(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// 502 carrying `UNAVAILABLE` in the headers, so RPC clients see a
/// trailers-only failure rather than an undecodable body.
fn bad_gateway() -> Response<Body> {
    let mut response: Response<Body> = tonic::Status::unavailable("upstream request failed").into_http();
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::{BodyExt, Full};

    use super::*;
    use crate::grpcweb::{encode_messages, DEFAULT_MAX_FRAME_LEN};
    use crate::net::alpn::AlpnNegotiator;
    use crate::net::transport::ProtocolTable;

    fn proxy() -> ReverseProxy {
        let connector = ForwardConnector::new(
            None,
            ProtocolTable::new(&AlpnNegotiator::default()),
            Duration::from_secs(1),
        );
        ReverseProxy::new(connector, "central.example.com:8443", false, DEFAULT_MAX_FRAME_LEN)
            .unwrap()
    }

    #[test]
    fn director_rewrites_target_and_headers() {
        let mut req = Request::builder()
            .uri("http://127.0.0.1:9999/svc/Get?x=1")
            .version(Version::HTTP_2)
            .header(CONTENT_TYPE, "application/grpc+proto")
            .header(header::TE, "trailers")
            .header(header::CONNECTION, "keep-alive")
            .header("grpc-timeout", "1S")
            .body(Body::empty())
            .unwrap();

        proxy().direct(&mut req);

        assert_eq!(req.uri(), "http://central.example.com:8443/svc/Get?x=1");
        assert_eq!(req.version(), Version::HTTP_11);
        assert!(req.headers().get(header::TE).is_none());
        assert!(req.headers().get(header::CONNECTION).is_none());
        assert_eq!(req.headers()["grpc-timeout"], "1S");
        assert_eq!(
            req.headers()[header::ACCEPT],
            "application/grpc+proto, application/grpc-web+proto"
        );
    }

    #[tokio::test]
    async fn web_response_becomes_native_with_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let mut message = vec![0u8, 0, 0, 0, 2];
        message.extend_from_slice(b"hi");
        let body = encode_messages([&message[5..]], &trailers).unwrap();

        let upstream = Response::builder()
            .header(CONTENT_TYPE, "application/grpc-web+proto")
            .header(CONTENT_LENGTH, body.len())
            .body(Full::new(body))
            .unwrap();

        let response = finalize_response(proxy().modify_response(upstream));
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc+proto");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert!(response.headers().get(EMPTY_BODY_MARKER).is_none());

        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["grpc-status"], "0");
        assert_eq!(collected.to_bytes(), Bytes::from(message));
    }

    #[tokio::test]
    async fn empty_response_is_marked_then_stripped() {
        let upstream = Response::builder()
            .header(CONTENT_TYPE, "application/grpc-web")
            .header("grpc-status", "5")
            .header(CONTENT_LENGTH, "0")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let modified = proxy().modify_response(upstream);
        assert!(modified.headers().contains_key(EMPTY_BODY_MARKER));
        assert_eq!(modified.headers()[CONTENT_TYPE], "application/grpc");

        let response = finalize_response(modified);
        assert!(!response.headers().contains_key(EMPTY_BODY_MARKER));
        assert_eq!(response.headers()["grpc-status"], "5");
        assert!(http_body::Body::is_end_stream(response.body()));
    }

    #[tokio::test]
    async fn native_response_passes_through() {
        let upstream = Response::builder()
            .header(CONTENT_TYPE, "application/grpc")
            .body(Full::new(Bytes::from_static(b"\0\0\0\0\x01a")))
            .unwrap();

        let response = finalize_response(proxy().modify_response(upstream));
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"\0\0\0\0\x01a");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = ForwardConnector::new(
            None,
            ProtocolTable::new(&AlpnNegotiator::default()),
            Duration::from_secs(1),
        );
        let proxy = ReverseProxy::new(connector, &addr, false, DEFAULT_MAX_FRAME_LEN).unwrap();
        let req = Request::builder()
            .uri("/svc/Get")
            .body(Body::empty())
            .unwrap();
        let response = proxy.handle(req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["grpc-status"], "14");
        let status = tonic::Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.message(), "upstream request failed");
    }
}

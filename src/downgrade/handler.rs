//! Server Downgrade Handler.
//!
//! Wraps an RPC server's request handler so that clients reaching it over a
//! hop without HTTP trailers still receive the final status. Requests whose
//! content type is not `application/grpc[+subtype]` go to the fallback
//! service untouched. RPC requests are classified, in order:
//!
//! 1. Not HTTP/2: only methods without client streaming may pass, and their
//!    version is rewritten to HTTP/2 for the inner dispatcher.
//! 2. `TE: trailers` present: dispatched unchanged.
//! 3. Otherwise the client must accept web framing; the response is then
//!    re-encoded with the trailers as a final in-body frame.
//!
//! Rejections answer HTTP 500 carrying a trailers-only RPC status, so RPC
//! clients read the reason from `grpc-message` and plain HTTP clients still
//! see a server error.

use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::response::IntoResponse;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TE};
use http::{HeaderValue, Request, Response, StatusCode, Version};

use super::content_type::{self, Framing, RpcContentType};
use crate::grpcweb::error::BoxError;
use crate::grpcweb::WebEncodeBody;
use crate::observability::metrics;

/// One RPC method of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, client_streaming: bool, server_streaming: bool) -> Self {
        Self {
            name: name.into(),
            client_streaming,
            server_streaming,
        }
    }

    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, false, false)
    }
}

/// A registered RPC service and its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Fully qualified name, e.g. `pkg.Service`.
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// `/<service>/<method>` for `method`.
    pub fn full_path(&self, method: &MethodDescriptor) -> String {
        format!("/{}/{}", self.name, method.name)
    }
}

/// Why a request could not be served to this client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("method {path} cannot be downgraded")]
    CannotDowngrade { path: String },

    #[error("client neither supports trailers nor web responses")]
    NoTrailersNorWeb,
}

impl NegotiationError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::CannotDowngrade { .. } => "rejected_streaming",
            Self::NoTrailersNorWeb => "rejected_negotiation",
        }
    }

    /// The RPC status reported to the client.
    pub fn code(&self) -> tonic::Code {
        match self {
            Self::CannotDowngrade { .. } => tonic::Code::Unimplemented,
            Self::NoTrailersNorWeb => tonic::Code::Internal,
        }
    }
}

impl IntoResponse for NegotiationError {
    fn into_response(self) -> axum::response::Response {
        let mut response: Response<Body> = tonic::Status::new(self.code(), self.to_string()).into_http();
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}

/// Default fallback: 404 for anything that is not an RPC request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl tower::Service<Request<Body>> for NotFound {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<Body>) -> Self::Future {
        std::future::ready(Ok(StatusCode::NOT_FOUND.into_response()))
    }
}

/// How a request will be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// HTTP/2 with trailers: untouched.
    Passthrough,
    /// Downgraded transport, but the client handles trailers.
    Native,
    /// Trailers must travel in the body.
    Web,
}

impl Dispatch {
    fn outcome(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Native => "native",
            Self::Web => "web",
        }
    }
}

/// Tower service wrapping an RPC handler `S`; everything else goes to `F`.
pub struct DowngradeHandler<S, F = NotFound> {
    inner: S,
    fallback: F,
    valid_paths: Arc<HashSet<String>>,
}

impl<S: Clone, F: Clone> Clone for DowngradeHandler<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            fallback: self.fallback.clone(),
            valid_paths: Arc::clone(&self.valid_paths),
        }
    }
}

impl<S> DowngradeHandler<S> {
    /// Precompute the paths that may be served over a downgraded hop:
    /// every method of `services` without client streaming.
    pub fn new(inner: S, services: &[ServiceDescriptor]) -> Self {
        let valid_paths: HashSet<String> = services
            .iter()
            .flat_map(|service| {
                service
                    .methods
                    .iter()
                    .filter(|m| !m.client_streaming)
                    .map(move |m| service.full_path(m))
            })
            .collect();
        tracing::debug!(paths = valid_paths.len(), "Downgradable methods registered");
        Self {
            inner,
            fallback: NotFound,
            valid_paths: Arc::new(valid_paths),
        }
    }
}

impl<S, F> DowngradeHandler<S, F> {
    /// Serve non-RPC requests with `fallback` instead of a 404.
    pub fn with_fallback<G>(self, fallback: G) -> DowngradeHandler<S, G> {
        DowngradeHandler {
            inner: self.inner,
            fallback,
            valid_paths: self.valid_paths,
        }
    }

    pub fn is_downgradable(&self, path: &str) -> bool {
        self.valid_paths.contains(path)
    }

    fn classify<B>(&self, req: &mut Request<B>) -> Result<Dispatch, NegotiationError> {
        let downgraded = req.version() != Version::HTTP_2;
        if downgraded {
            let path = req.uri().path();
            if !self.is_downgradable(path) {
                return Err(NegotiationError::CannotDowngrade {
                    path: path.to_string(),
                });
            }
            *req.version_mut() = Version::HTTP_2;
        }

        if content_type::accepts_trailers(req.headers()) {
            return Ok(if downgraded {
                Dispatch::Native
            } else {
                Dispatch::Passthrough
            });
        }

        if !content_type::accepts_web(req.headers()) {
            return Err(NegotiationError::NoTrailersNorWeb);
        }
        // Some runtimes only compute trailers when the client claims support.
        req.headers_mut()
            .insert(TE, HeaderValue::from_static("trailers"));
        Ok(Dispatch::Web)
    }
}

/// Whether the request carries native RPC framing.
fn is_rpc<B>(req: &Request<B>) -> bool {
    RpcContentType::from_headers(req.headers()).is_some_and(|ct| ct.framing == Framing::Native)
}

impl<S, F, ResBody, FallbackBody> tower::Service<Request<Body>> for DowngradeHandler<S, F>
where
    S: tower::Service<Request<Body>, Response = Response<ResBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ResBody: http_body::Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
    F: tower::Service<Request<Body>, Response = Response<FallbackBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    F::Future: Send + 'static,
    FallbackBody: http_body::Body<Data = Bytes> + Send + 'static,
    FallbackBody::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.inner.poll_ready(cx))?;
        self.fallback.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        if !is_rpc(&req) {
            let clone = self.fallback.clone();
            let mut fallback = std::mem::replace(&mut self.fallback, clone);
            metrics::record_request("fallback");
            tracing::trace!(path = %req.uri().path(), "Not an RPC request, using fallback");
            return Box::pin(async move { Ok::<_, Infallible>(fallback.call(req).await?.map(Body::new)) });
        }

        // Use the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let dispatch = match self.classify(&mut req) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                metrics::record_request(e.outcome());
                tracing::warn!(path = %req.uri().path(), version = ?req.version(), error = %e, "Rejecting request");
                return Box::pin(async move { Ok(e.into_response()) });
            }
        };
        metrics::record_request(dispatch.outcome());
        tracing::debug!(path = %req.uri().path(), dispatch = ?dispatch, "Dispatching request");

        let request_type = RpcContentType::from_headers(req.headers());
        Box::pin(async move {
            let response = inner.call(req).await?;
            if dispatch != Dispatch::Web {
                return Ok(response.map(Body::new));
            }
            Ok::<_, Infallible>(encode_web_response(response, request_type))
        })
    }
}

/// Re-encode a native response so its trailers travel in the body.
fn encode_web_response<B>(response: Response<B>, request_type: Option<RpcContentType>) -> Response<Body>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = response.into_parts();
    let native = RpcContentType::from_headers(&parts.headers)
        .or(request_type)
        .unwrap_or_else(|| RpcContentType::native(None));
    parts
        .headers
        .insert(CONTENT_TYPE, native.to_web().header_value());
    parts.headers.remove(CONTENT_LENGTH);

    // Trailers-only: the status already rides in the headers.
    if parts.headers.contains_key("grpc-status") && http_body::Body::is_end_stream(&body) {
        return Response::from_parts(parts, Body::empty());
    }
    Response::from_parts(parts, Body::new(WebEncodeBody::new(Body::new(body))))
}

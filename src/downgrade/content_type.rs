//! RPC content types.
//!
//! `application/grpc[+subtype]` is native framing, `application/grpc-web[+subtype]`
//! is trailer-in-body framing. The subtype survives conversion in both
//! directions. Media-type parameters (`; charset=...`) are ignored.

use std::fmt;

use http::header::{ACCEPT, TE};
use http::{HeaderMap, HeaderValue};

pub const GRPC: &str = "application/grpc";
pub const GRPC_WEB: &str = "application/grpc-web";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Native,
    Web,
}

/// A parsed RPC content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcContentType {
    pub framing: Framing,
    pub subtype: Option<String>,
}

impl RpcContentType {
    pub fn native(subtype: Option<&str>) -> Self {
        Self {
            framing: Framing::Native,
            subtype: subtype.map(str::to_string),
        }
    }

    pub fn web(subtype: Option<&str>) -> Self {
        Self {
            framing: Framing::Web,
            subtype: subtype.map(str::to_string),
        }
    }

    /// Parse a single media type. Anything that is not an RPC type is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let media = value.split(';').next()?.trim().to_ascii_lowercase();
        // grpc-web first: "application/grpc" is a prefix of it.
        let (framing, rest) = if let Some(rest) = media.strip_prefix(GRPC_WEB) {
            (Framing::Web, rest)
        } else if let Some(rest) = media.strip_prefix(GRPC) {
            (Framing::Native, rest)
        } else {
            return None;
        };
        let subtype = match rest {
            "" => None,
            _ => Some(rest.strip_prefix('+').filter(|s| !s.is_empty())?.to_string()),
        };
        Some(Self { framing, subtype })
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }

    pub fn is_web(&self) -> bool {
        self.framing == Framing::Web
    }

    /// Same subtype, native framing.
    pub fn to_native(&self) -> Self {
        Self::native(self.subtype.as_deref())
    }

    /// Same subtype, web framing.
    pub fn to_web(&self) -> Self {
        Self::web(self.subtype.as_deref())
    }

    pub fn header_value(&self) -> HeaderValue {
        // Subtypes come from parsed header values and stay valid; fall back
        // to the bare type otherwise.
        HeaderValue::from_str(&self.to_string()).unwrap_or_else(|_| {
            HeaderValue::from_static(match self.framing {
                Framing::Native => GRPC,
                Framing::Web => GRPC_WEB,
            })
        })
    }
}

impl fmt::Display for RpcContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.framing {
            Framing::Native => GRPC,
            Framing::Web => GRPC_WEB,
        };
        match &self.subtype {
            Some(subtype) => write!(f, "{base}+{subtype}"),
            None => f.write_str(base),
        }
    }
}

/// `Accept` value naming both native and web framing for `subtype`.
pub fn accept_both(subtype: Option<&str>) -> HeaderValue {
    let value = format!(
        "{}, {}",
        RpcContentType::native(subtype),
        RpcContentType::web(subtype)
    );
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("application/grpc, application/grpc-web"))
}

/// Whether `TE` lists `trailers`.
pub fn accepts_trailers(headers: &HeaderMap) -> bool {
    header_tokens(headers, TE).any(|token| {
        token
            .split(';')
            .next()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("trailers"))
    })
}

/// Whether `Accept` lists a web-framed RPC type.
pub fn accepts_web(headers: &HeaderMap) -> bool {
    header_tokens(headers, ACCEPT)
        .filter_map(RpcContentType::parse)
        .any(|ct| ct.is_web())
}

fn header_tokens(headers: &HeaderMap, name: http::header::HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

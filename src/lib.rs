//! gRPC ⇄ HTTP/1.1 downgrade bridge.
//!
//! Lets a standard RPC stack (HTTP/2, mid-stream trailers) work across hops
//! that only forward HTTP/1.1.
//!
//! # Architecture Overview
//!
//! ```text
//!   client process                                         server process
//!  ┌──────────────────────────────────────┐            ┌──────────────────────────────┐
//!  │ tonic client                         │            │ DowngradeServer              │
//!  │   │ DowngradeChannel                 │            │   │ (TCP/TLS, h1 + h2)       │
//!  │   ▼                                  │            │   ▼                          │
//!  │ net::pipe ──▶ local proxy server     │  HTTP/1.1  │ DowngradeHandler             │
//!  │              (http::serve)           │  or h2     │   │ gate / classify          │
//!  │                │                     │───────────▶│   │ grpcweb::WebEncodeBody   │
//!  │                ▼                     │            │   ▼                          │
//!  │ http::proxy (director, post-process) │◀───────────│ RPC server                   │
//!  │   grpcweb::WebDecodeBody             │            │                              │
//!  │ credentials (side-channel identity)  │            │ net::alpn / net::tls         │
//!  └──────────────────────────────────────┘            └──────────────────────────────┘
//! ```

// Core subsystems
pub mod downgrade;
pub mod grpcweb;
pub mod http;
pub mod net;

// Security
pub mod credentials;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::BridgeConfig;
pub use downgrade::{ClientOptions, DowngradeChannel, DowngradeClient, DowngradeHandler};
pub use http::DowngradeServer;
pub use lifecycle::Shutdown;

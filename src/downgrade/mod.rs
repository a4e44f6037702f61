//! gRPC ⇄ HTTP/1.1 downgrade.
//!
//! # Data Flow
//! ```text
//! calling code
//!     → client.rs (DowngradeClient: tonic over a pipe to the local proxy)
//!     → network hop that may only speak HTTP/1.1
//!     → handler.rs (DowngradeHandler: gate, classify, re-encode trailers)
//!     → RPC server
//! ```
//!
//! content_type.rs holds the native/web media type rules both sides share.

pub mod client;
pub mod content_type;
pub mod handler;

pub use client::{ClientError, ClientOptions, DowngradeChannel, DowngradeClient};
pub use handler::{DowngradeHandler, MethodDescriptor, NegotiationError, ServiceDescriptor};

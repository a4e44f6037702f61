//! HTTP serving and proxying.
//!
//! # Data Flow
//! ```text
//! Accept (TCP listener or pipe)
//!     → serve.rs (optional TLS, HTTP/1.1 + HTTP/2 auto-detection, flush policy)
//!     → proxy.rs (client side: forward to the real endpoint)
//!       or server.rs (server side: a DowngradeHandler)
//! ```

pub mod proxy;
pub mod serve;
pub mod server;

pub use proxy::ReverseProxy;
pub use serve::{Accept, ConnectionServer, FlushOnWrite, FlushPolicy};
pub use server::DowngradeServer;

//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side:
//!     RPC runtime → pipe.rs (in-process dial) → local proxy server
//!     local proxy → transport.rs (TCP + TLS with alpn.rs preferences) → endpoint
//!
//! Server side:
//!     listener.rs (accept loop, connection limits)
//!     → tls.rs (optional handshake, per-client config with alpn.rs preferences)
//!     → connection.rs (lifecycle tracking)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - The pipe never touches the OS network stack
//! - TLS is optional and handled transparently

pub mod alpn;
pub mod connection;
pub mod listener;
pub mod pipe;
pub mod tls;
pub mod transport;

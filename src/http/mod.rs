//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, client connection facts)
//!     → proxy::Dispatcher (resolve, rewrite, forward, instrument)
//!     → response head returned to the client, body keeps streaming
//! ```

pub mod server;

pub use server::HttpServer;

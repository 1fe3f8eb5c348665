//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! listener config
//!     → listener.rs (parse address, bind TCP)
//!     → tls.rs (optional rustls config for axum-server)
//!     → Hand off to HTTP layer
//! ```

pub mod listener;
pub mod tls;

pub use listener::ListenerError;

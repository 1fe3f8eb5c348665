//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting → in-flight exchanges drain → exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;

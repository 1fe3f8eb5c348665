//! Request dispatch and forwarding.
//!
//! # Data Flow
//! ```text
//! server handler
//!     → dispatcher.rs (resolve, rewrite, classify, instrument)
//!         → headers.rs (forwarding headers)
//!         → classify.rs (tunnel / stream / buffered)
//!         → engine
//!             buffered.rs over transport.rs (plain HTTP and SSE)
//!             tunnel.rs (websocket upgrades)
//!             compression.rs (optional gzip wrapper)
//!         → instrument.rs (timers, status metric, access log)
//! ```

pub mod buffered;
pub mod classify;
pub mod compression;
pub mod dispatcher;
pub mod engine;
pub mod headers;
pub mod instrument;
pub mod transport;
pub mod tunnel;

pub use classify::Classification;
pub use dispatcher::{ConfigurationError, DispatchSettings, Dispatcher, DispatcherBuilder};
pub use engine::{CaptureResponse, CapturedResponse, Engine, ResponseWriter};
pub use headers::ClientConn;
pub use transport::{HttpTransport, Transport, TransportError};

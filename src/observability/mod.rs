//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher (after the engine finishes):
//!     → metrics.rs (target timer, aggregate timer, status-keyed timer)
//!     → access_log.rs (one event per captured upstream response)
//!
//! Everything else:
//!     → logging.rs (structured tracing events)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metric updates are atomic operations on shared handles
//! - No-route and rejected requests never reach the access log

pub mod access_log;
pub mod logging;
pub mod metrics;

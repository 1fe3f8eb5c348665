//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup in priority order)
//!     → matcher.rs (evaluate match conditions)
//!     → load_balancer (pick one target of the route)
//!     → Return: Target or None (no route)
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Compile matchers and targets (with their timers)
//!     → Sort by priority, then prefix length
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled ahead of time, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - First match wins

pub mod matcher;
pub mod router;
pub mod target;

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;

pub use router::{RouteTable, SharedRouteTable};
pub use target::Target;

/// Resolves the backend target for a request.
///
/// Called concurrently from every request task.
pub trait Resolve: Send + Sync {
    fn resolve(&self, req: &Request<Body>) -> Option<Arc<Target>>;
}

impl<F> Resolve for F
where
    F: Fn(&Request<Body>) -> Option<Arc<Target>> + Send + Sync,
{
    fn resolve(&self, req: &Request<Body>) -> Option<Arc<Target>> {
        self(req)
    }
}

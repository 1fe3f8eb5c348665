//! Target selection subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → candidate targets identified
//!     → Apply selection strategy:
//!         - round_robin.rs (rotate through targets)
//!         - random.rs (uniform random pick)
//!     → Return the chosen target
//! ```
//!
//! # Design Decisions
//! - Strategy chosen once per route table (config `proxy.strategy`)
//! - Selection state is per route, so routes do not skew each other

pub mod random;
pub mod round_robin;

use std::sync::Arc;

use crate::config::Strategy;
use crate::routing::target::Target;

/// Picks one target out of a route's candidates.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_target(&self, targets: &[Arc<Target>]) -> Option<Arc<Target>>;
}

/// Build the selector for a configured strategy.
pub fn for_strategy(strategy: Strategy) -> Box<dyn LoadBalancer> {
    match strategy {
        Strategy::Rr => Box::new(round_robin::RoundRobin::new()),
        Strategy::Rnd => Box::new(random::Random),
    }
}

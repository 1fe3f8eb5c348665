//! Random target selection.

use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::routing::target::Target;

/// Uniform random selector.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl LoadBalancer for Random {
    fn next_target(&self, targets: &[Arc<Target>]) -> Option<Arc<Target>> {
        match targets.len() {
            0 => None,
            1 => Some(targets[0].clone()),
            n => Some(targets[fastrand::usize(..n)].clone()),
        }
    }
}

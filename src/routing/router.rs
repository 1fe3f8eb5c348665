//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request and pick one of its targets
//! - Return the target or an explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Reload builds a new table and swaps it in one atomic store
//! - O(n) scan in priority order (acceptable for typical route counts)

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::Request;
use url::Url;

use crate::config::{RouteConfig, Strategy};
use crate::load_balancer::{self, LoadBalancer};
use crate::observability::metrics::Registry;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::routing::target::{timer_name, Target};
use crate::routing::Resolve;

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    name: String,
    matcher: AndMatcher,
    priority: u32,
    prefix_len: usize,
    targets: Vec<Arc<Target>>,
    balancer: Box<dyn LoadBalancer>,
}

impl Route {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }
}

/// Immutable routing table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Compile routes from configuration.
    ///
    /// Targets with unusable URLs are skipped with a warning; a route left
    /// without targets is dropped.
    pub fn from_config(configs: &[RouteConfig], strategy: Strategy, registry: &Registry) -> Self {
        let mut routes = Vec::with_capacity(configs.len());

        for config in configs {
            let strip_path = config.strip_path.clone().unwrap_or_default();
            let targets: Vec<Arc<Target>> = config
                .targets
                .iter()
                .filter_map(|raw| match Url::parse(raw) {
                    Ok(url) => {
                        let name = timer_name(&config.name, config.host.as_deref(), &config.path_prefix, &url);
                        Some(Arc::new(Target::new(
                            config.name.clone(),
                            url,
                            strip_path.clone(),
                            registry.get_timer(&name),
                        )))
                    }
                    Err(e) => {
                        tracing::warn!(route = %config.name, target = %raw, error = %e, "Skipping invalid target");
                        None
                    }
                })
                .collect();

            if targets.is_empty() {
                tracing::warn!(route = %config.name, "Route has no usable targets, skipping");
                continue;
            }

            let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
            if let Some(host) = &config.host {
                matchers.push(Box::new(HostMatcher::new(host.clone())));
            }
            matchers.push(Box::new(PathPrefixMatcher::new(config.path_prefix.clone())));

            routes.push(Route {
                name: config.name.clone(),
                matcher: AndMatcher::new(matchers),
                priority: config.priority,
                prefix_len: config.path_prefix.len(),
                targets,
                balancer: load_balancer::for_strategy(strategy),
            });
        }

        // Higher priority first, then the most specific prefix.
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.prefix_len.cmp(&a.prefix_len))
        });

        tracing::debug!(routes = routes.len(), "Route table compiled");
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Find the first matching route and pick one of its targets.
    pub fn lookup(&self, req: &Request<Body>) -> Option<Arc<Target>> {
        self.routes
            .iter()
            .find(|route| route.matcher.matches(req))
            .and_then(|route| route.balancer.next_target(&route.targets))
    }
}

impl Resolve for RouteTable {
    fn resolve(&self, req: &Request<Body>) -> Option<Arc<Target>> {
        self.lookup(req)
    }
}

/// A route table that can be replaced while requests are in flight.
#[derive(Debug)]
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Replace the table. In-flight lookups keep the table they loaded.
    pub fn store(&self, table: RouteTable) {
        self.current.store(Arc::new(table));
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }
}

impl Resolve for SharedRouteTable {
    fn resolve(&self, req: &Request<Body>) -> Option<Arc<Target>> {
        self.current.load().lookup(req)
    }
}

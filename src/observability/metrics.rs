//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Named timers and counters, created on first use
//! - Local snapshots for inspection (tests, shutdown summary)
//! - Mirror every update to the `metrics` facade for Prometheus scraping
//!
//! # Metrics
//! - `requests` (timer): every forwarded request
//! - `notfound` (counter): requests without a route
//! - `http.status.<code>` (timer): forwarded requests by upstream status
//! - `route.<route>.<host>.<path>.<target>` (timer): per target latency
//!
//! # Design Decisions
//! - The registry is injected, never a process global
//! - Handles are cheap clones sharing the same atomics
//! - Prometheus sanitizes the dotted names into underscores

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

#[derive(Debug, Default)]
struct TimerCell {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

/// A latency timer.
#[derive(Clone)]
pub struct Timer {
    name: Arc<str>,
    cell: Arc<TimerCell>,
    histogram: metrics::Histogram,
}

impl Timer {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            cell: Arc::new(TimerCell::default()),
            histogram: metrics::histogram!(name.to_owned()),
        }
    }

    /// Timer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one observation.
    pub fn update(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.cell.count.fetch_add(1, Ordering::Relaxed);
        self.cell.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.cell.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.histogram.record(elapsed.as_secs_f64());
    }

    /// Record the time elapsed since `start`.
    pub fn update_since(&self, start: Instant) {
        self.update(start.elapsed());
    }

    /// Number of recorded observations.
    pub fn count(&self) -> u64 {
        self.cell.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total = self.cell.total_nanos.load(Ordering::Relaxed);
        TimerSnapshot {
            count,
            mean: Duration::from_nanos(total.checked_div(count).unwrap_or(0)),
            max: Duration::from_nanos(self.cell.max_nanos.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

/// Point-in-time view of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub mean: Duration,
    pub max: Duration,
}

/// A monotonically increasing counter.
#[derive(Clone)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
    counter: metrics::Counter,
}

impl Counter {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            value: Arc::new(AtomicU64::new(0)),
            counter: metrics::counter!(name.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
        self.counter.increment(n);
    }

    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

/// Registry of named timers and counters.
///
/// Safe for concurrent use; lookups of existing names do not block writers
/// of other names.
#[derive(Debug, Default)]
pub struct Registry {
    timers: DashMap<String, Timer>,
    counters: DashMap<String, Counter>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the timer with the given name, registering it on first use.
    pub fn get_timer(&self, name: &str) -> Timer {
        if let Some(timer) = self.timers.get(name) {
            return timer.clone();
        }
        self.timers
            .entry(name.to_owned())
            .or_insert_with(|| Timer::new(name))
            .clone()
    }

    /// Get the counter with the given name, registering it on first use.
    pub fn get_counter(&self, name: &str) -> Counter {
        if let Some(counter) = self.counters.get(name) {
            return counter.clone();
        }
        self.counters
            .entry(name.to_owned())
            .or_insert_with(|| Counter::new(name))
            .clone()
    }

    /// Look up a timer without registering it.
    pub fn find_timer(&self, name: &str) -> Option<Timer> {
        self.timers.get(name).map(|t| t.clone())
    }

    /// Snapshot of every registered timer, sorted by name.
    pub fn timers(&self) -> BTreeMap<String, TimerSnapshot> {
        self.timers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Current value of every registered counter, sorted by name.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().count()))
            .collect()
    }
}

//! Per-request metrics and access logging.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::StatusCode;

use crate::observability::access_log::{AccessEvent, AccessLogger, RequestSummary};
use crate::observability::metrics::{Registry, Timer};
use crate::proxy::engine::CapturedResponse;
use crate::routing::Target;

/// Registry name of the per-status timer.
pub fn status_key(status: StatusCode) -> String {
    format!("http.status.{}", status.as_u16())
}

/// Start and end of one forwarded exchange.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start: SystemTime,
    pub end: SystemTime,
    pub elapsed: Duration,
}

/// Sinks updated after every forwarded request.
#[derive(Clone)]
pub struct Instrumentation {
    registry: Arc<Registry>,
    requests: Option<Timer>,
    access_log: Option<Arc<dyn AccessLogger>>,
}

impl Instrumentation {
    pub fn new(
        registry: Arc<Registry>,
        requests: Option<Timer>,
        access_log: Option<Arc<dyn AccessLogger>>,
    ) -> Self {
        Self {
            registry,
            requests,
            access_log,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Record a finished exchange.
    ///
    /// Target and aggregate timers always move; the status timer and the
    /// access log only when an upstream response was captured.
    pub fn record(
        &self,
        target: &Target,
        timing: Timing,
        request: &RequestSummary,
        captured: Option<&CapturedResponse>,
    ) {
        target.timer().update(timing.elapsed);
        if let Some(requests) = &self.requests {
            requests.update(timing.elapsed);
        }

        let Some(response) = captured else {
            return;
        };

        self.registry
            .get_timer(&status_key(response.status))
            .update(timing.elapsed);

        if let Some(logger) = &self.access_log {
            logger.log(&AccessEvent {
                start: timing.start,
                end: timing.end,
                request,
                response,
                upstream_addr: target.upstream_addr(),
                upstream_url: target.url(),
            });
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("requests", &self.requests)
            .field("access_log", &self.access_log.is_some())
            .finish()
    }
}

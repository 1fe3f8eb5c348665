//! Access logging for forwarded requests.
//!
//! One event per request whose engine captured an upstream response.
//! Events go through `tracing` on the `access_log` target so they can be
//! filtered or routed separately from the process log.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Uri, Version};
use url::Url;

use crate::config::LogFormat;
use crate::proxy::engine::CapturedResponse;

/// The parts of the forwarded request kept for logging.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: String,
}

impl RequestSummary {
    pub fn new(req: &Request<Body>, remote_addr: &str) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            remote_addr: remote_addr.to_owned(),
        }
    }

    fn header(&self, name: header::HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
    }
}

/// A completed request as seen by the access log.
#[derive(Debug)]
pub struct AccessEvent<'a> {
    pub start: SystemTime,
    pub end: SystemTime,
    pub request: &'a RequestSummary,
    pub response: &'a CapturedResponse,
    pub upstream_addr: &'a str,
    pub upstream_url: &'a Url,
}

impl AccessEvent<'_> {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

/// Sink for access events. Must be safe to call from any request task.
pub trait AccessLogger: Send + Sync {
    fn log(&self, event: &AccessEvent<'_>);
}

/// Access logger writing through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLogger {
    format: LogFormat,
}

impl TracingAccessLogger {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }
}

fn unix_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

/// Render an event as a single JSON object.
pub fn to_json(event: &AccessEvent<'_>) -> serde_json::Value {
    serde_json::json!({
        "start_ms": unix_millis(event.start) as u64,
        "end_ms": unix_millis(event.end) as u64,
        "duration_us": event.duration().as_micros() as u64,
        "remote_addr": event.request.remote_addr,
        "method": event.request.method.as_str(),
        "uri": event.request.uri.to_string(),
        "proto": format!("{:?}", event.request.version),
        "host": event.request.header(header::HOST),
        "user_agent": event.request.header(header::USER_AGENT),
        "referer": event.request.header(header::REFERER),
        "status": event.response.status.as_u16(),
        "upstream_addr": event.upstream_addr,
        "upstream_url": event.upstream_url.as_str(),
    })
}

impl AccessLogger for TracingAccessLogger {
    fn log(&self, event: &AccessEvent<'_>) {
        match self.format {
            LogFormat::Json => {
                tracing::info!(target: "access_log", "{}", to_json(event));
            }
            LogFormat::Text => {
                tracing::info!(
                    target: "access_log",
                    remote_addr = %event.request.remote_addr,
                    method = %event.request.method,
                    uri = %event.request.uri,
                    status = event.response.status.as_u16(),
                    duration_us = event.duration().as_micros() as u64,
                    upstream_addr = %event.upstream_addr,
                    upstream_url = %event.upstream_url,
                    user_agent = %event.request.header(header::USER_AGENT),
                    "request"
                );
            }
        }
    }
}

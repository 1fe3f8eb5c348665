//! Protocol classification.
//!
//! Decides how a request is forwarded from two headers:
//! `Upgrade: websocket` (any case) tunnels, `Accept: text/event-stream`
//! streams, everything else is buffered. The upgrade check runs first.

use std::time::Duration;

use axum::http::{header, HeaderMap};

/// Dispatch strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Protocol upgrade; relayed as raw bytes.
    Tunnel,
    /// Server-sent events; buffered engine with periodic flushing.
    Stream,
    /// Plain request/response.
    Buffered,
}

pub(crate) fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

impl Classification {
    pub fn of(headers: &HeaderMap) -> Self {
        if is_websocket(headers) {
            return Classification::Tunnel;
        }
        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        if accept == Some("text/event-stream") {
            return Classification::Stream;
        }
        Classification::Buffered
    }

    /// Flush interval for the buffered engine: the configured one for
    /// streams, zero otherwise.
    pub fn flush_interval(self, configured: Duration) -> Duration {
        match self {
            Classification::Stream => configured,
            Classification::Tunnel | Classification::Buffered => Duration::ZERO,
        }
    }
}

//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Dispatch settings (no-route status, flushing, compression).
    pub proxy: DispatchConfig,

    /// Forwarding header rewrite settings.
    pub headers: HeaderConfig,

    /// Route definitions mapping requests to targets.
    pub routes: Vec<RouteConfig>,

    /// Timeout configuration for the outbound transport.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9999").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9999".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Target selection strategy when a route has several targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Random pick per request.
    #[default]
    Rnd,
    /// Round-robin rotation.
    Rr,
}

/// Per-request dispatch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Status written when no target resolves.
    pub no_route_status: u16,

    /// Flush interval for server-sent event streams, in milliseconds.
    pub flush_interval_ms: u64,

    /// Response content types eligible for gzip. `None` disables compression.
    pub gzip_content_types: Option<Vec<String>>,

    /// Target selection strategy.
    pub strategy: Strategy,

    /// Name of the aggregate request timer. Empty disables it.
    pub request_timer: String,

    /// Name of the no-route counter.
    pub noroute_counter: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            no_route_status: 404,
            flush_interval_ms: 1000,
            gzip_content_types: None,
            strategy: Strategy::Rnd,
            request_timer: "requests".to_string(),
            noroute_counter: "notfound".to_string(),
        }
    }
}

/// Forwarding header configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Add or append the client host to `X-Forwarded-For`.
    pub forward_for: bool,

    /// Set `X-Forwarded-Host` from `Host` when absent.
    pub forward_host: bool,

    /// Set `X-Forwarded-Proto` when absent.
    pub forward_proto: bool,

    /// Address appended as `by=` to the `Forwarded` header.
    pub local_ip: Option<String>,

    /// Extra header carrying the client IP.
    pub client_ip_header: Option<String>,

    /// Header set on TLS connections and removed otherwise.
    pub tls_header: Option<String>,

    /// Value for `tls_header`.
    pub tls_header_value: String,

    /// Header carrying a generated request ID when absent.
    pub request_id_header: Option<String>,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            forward_for: true,
            forward_host: true,
            forward_proto: true,
            local_ip: None,
            client_ip_header: None,
            tls_header: None,
            tls_header_value: String::new(),
            request_id_header: None,
        }
    }
}

/// Route configuration mapping requests to targets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match, port ignored).
    pub host: Option<String>,

    /// Path prefix to match.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Prefix removed from the path before forwarding.
    #[serde(default)]
    pub strip_path: Option<String>,

    /// Target URLs (e.g., "http://127.0.0.1:3000").
    pub targets: Vec<String>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

/// Timeout configuration for outbound connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time to wait for upstream response headers in seconds. 0 disables.
    pub response_header_secs: u64,

    /// Idle pooled connection timeout in seconds.
    pub idle_secs: u64,

    /// Maximum idle pooled connections per upstream host.
    pub max_idle_per_host: usize,

    /// Dial timeout for tunnel upstream connections in seconds.
    pub tunnel_dial_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            response_header_secs: 0,
            idle_secs: 90,
            max_idle_per_host: 32,
            tunnel_dial_secs: 10,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Format of the process log.
    pub log_format: LogFormat,

    /// Emit one access log event per forwarded request.
    pub access_log: bool,

    /// Format of access log events.
    pub access_log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            access_log: true,
            access_log_format: LogFormat::Text,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9998".to_string(),
        }
    }
}

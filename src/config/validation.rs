//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (status codes, flush interval, addresses)
//! - Check that every route target is a usable upstream URL
//! - Check configured header names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::{HeaderName, StatusCode};
use thiserror::Error;
use url::Url;

use crate::config::schema::{HeaderConfig, ProxyConfig, RouteConfig};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid bind address {0:?}")]
    BindAddress(String),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("no_route_status {0} is not a valid HTTP status")]
    NoRouteStatus(u16),

    #[error("flush_interval_ms must be greater than zero")]
    FlushInterval,

    #[error("gzip_content_types must not contain empty entries")]
    GzipContentType,

    #[error("header option {option} has invalid header name {name:?}")]
    HeaderName { option: &'static str, name: String },

    #[error("route {route}: {reason}")]
    Route { route: String, reason: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if StatusCode::from_u16(config.proxy.no_route_status).is_err() {
        errors.push(ValidationError::NoRouteStatus(config.proxy.no_route_status));
    }

    if config.proxy.flush_interval_ms == 0 {
        errors.push(ValidationError::FlushInterval);
    }

    if let Some(types) = &config.proxy.gzip_content_types {
        if types.iter().any(|t| t.trim().is_empty()) {
            errors.push(ValidationError::GzipContentType);
        }
    }

    validate_headers(&config.headers, &mut errors);

    for route in &config.routes {
        validate_route(route, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_headers(headers: &HeaderConfig, errors: &mut Vec<ValidationError>) {
    let named = [
        ("client_ip_header", &headers.client_ip_header),
        ("tls_header", &headers.tls_header),
        ("request_id_header", &headers.request_id_header),
    ];

    for (option, name) in named {
        if let Some(name) = name.as_deref().filter(|n| !n.is_empty()) {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                errors.push(ValidationError::HeaderName {
                    option,
                    name: name.to_owned(),
                });
            }
        }
    }
}

fn validate_route(route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    let mut fail = |reason: String| {
        errors.push(ValidationError::Route {
            route: route.name.clone(),
            reason,
        })
    };

    if !route.path_prefix.starts_with('/') {
        fail(format!("path_prefix {:?} must start with '/'", route.path_prefix));
    }

    if let Some(strip) = &route.strip_path {
        if !strip.is_empty() && !strip.starts_with('/') {
            fail(format!("strip_path {:?} must start with '/'", strip));
        }
    }

    if route.targets.is_empty() {
        fail("at least one target is required".to_string());
    }

    for target in &route.targets {
        match Url::parse(target) {
            Ok(url) if url.scheme() != "http" => {
                fail(format!("target {target:?} must use the http scheme"));
            }
            Ok(url) if url.host_str().is_none() => {
                fail(format!("target {target:?} has no host"));
            }
            Ok(_) => {}
            Err(e) => fail(format!("target {target:?} is not a valid URL: {e}")),
        }
    }
}

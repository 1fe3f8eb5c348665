//! Resolved backend targets.

use url::Url;

use crate::observability::metrics::Timer;

/// A backend destination a request can be forwarded to.
#[derive(Debug, Clone)]
pub struct Target {
    /// Name of the route that owns this target.
    service: String,
    /// Destination URL (scheme, host, port, optional base path).
    url: Url,
    /// Prefix removed from the request path before forwarding. Empty = none.
    strip_path: String,
    /// `host[:port]` of the destination, as written in the URL.
    upstream_addr: String,
    /// Latency timer for requests forwarded to this target.
    timer: Timer,
}

impl Target {
    pub fn new(service: impl Into<String>, url: Url, strip_path: impl Into<String>, timer: Timer) -> Self {
        let upstream_addr = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            (None, _) => String::new(),
        };
        Self {
            service: service.into(),
            url,
            strip_path: strip_path.into(),
            upstream_addr,
            timer,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn strip_path(&self) -> &str {
        &self.strip_path
    }

    pub fn upstream_addr(&self) -> &str {
        &self.upstream_addr
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }
}

/// Timer name for a target: `route.<route>.<host>.<path>.<target-host>`.
///
/// Dots inside the components are replaced so the name stays splittable.
pub fn timer_name(route: &str, host: Option<&str>, path_prefix: &str, url: &Url) -> String {
    fn clean(s: &str) -> String {
        let s = s.trim_matches('/');
        if s.is_empty() {
            return "_".to_owned();
        }
        s.chars()
            .map(|c| if c == '.' || c == '/' || c == ':' { '_' } else { c })
            .collect()
    }

    let target = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_owned(),
        (None, _) => String::new(),
    };

    format!(
        "route.{}.{}.{}.{}",
        clean(route),
        clean(host.unwrap_or("")),
        clean(path_prefix),
        clean(&target)
    )
}

//! Forwarding header rewriting.
//!
//! # Responsibilities
//! - Split the client network address into host and port
//! - Add or append `X-Forwarded-For`, `X-Forwarded-Host`, `X-Forwarded-Proto`
//! - Add `X-Real-Ip`, `X-Forwarded-Port`, `Forwarded`
//! - Optional client IP, TLS marker and request ID headers
//!
//! The only failure is an unparsable client address, which aborts the request.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};
use thiserror::Error;
use uuid::Uuid;

use crate::config::HeaderConfig;
use crate::proxy::classify::is_websocket;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// The client address could not be split into host and port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse {addr}")]
pub struct AddressParseError {
    pub addr: String,
}

/// Connection facts recorded by the server for each request.
#[derive(Debug, Clone, Default)]
pub struct ClientConn {
    /// Remote address as reported by the listener, `host:port`.
    pub remote_addr: String,
    /// Port of the local listener.
    pub local_port: Option<u16>,
    /// Whether the client connection is TLS.
    pub tls: bool,
}

/// Split `host:port` or `[host]:port`.
pub fn split_host_port(addr: &str) -> Result<(&str, &str), AddressParseError> {
    let err = || AddressParseError {
        addr: addr.to_owned(),
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(err)?;
        let port = tail.strip_prefix(':').ok_or_else(err)?;
        if host.is_empty() || port.contains(':') {
            return Err(err());
        }
        return Ok((host, port));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(err)?;
    if host.contains(':') || host.contains('[') || host.contains(']') || port.contains(']') {
        return Err(err());
    }
    Ok((host, port))
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => tracing::debug!(header = %name, value, "Skipping invalid header value"),
    }
}

fn absent(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers.get(name).map(|v| v.is_empty()).unwrap_or(true)
}

fn configured_name(name: &Option<String>) -> Option<HeaderName> {
    name.as_deref()
        .filter(|n| !n.is_empty())
        .and_then(|n| HeaderName::from_bytes(n.as_bytes()).ok())
}

/// Scheme of the inbound request as seen by the upstream.
fn scheme(ws: bool, tls: bool) -> &'static str {
    match (ws, tls) {
        (true, true) => "wss",
        (true, false) => "ws",
        (false, true) => "https",
        (false, false) => "http",
    }
}

/// Rewrite forwarding headers of `req` for the client in `conn`.
pub fn rewrite(
    req: &mut Request<Body>,
    conn: &ClientConn,
    config: &HeaderConfig,
) -> Result<(), AddressParseError> {
    let (client_host, _) = split_host_port(&conn.remote_addr)?;
    let ws = is_websocket(req.headers());
    let proto = scheme(ws, conn.tls);
    let host_value = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let headers = req.headers_mut();

    if let Some(name) = configured_name(&config.client_ip_header) {
        if name != X_FORWARDED_FOR && name != X_REAL_IP {
            set(headers, name, client_host);
        }
    }

    if absent(headers, &X_REAL_IP) {
        set(headers, X_REAL_IP, client_host);
    }

    if config.forward_for {
        let chain = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if chain.is_empty() {
            set(headers, X_FORWARDED_FOR, client_host);
        } else {
            set(headers, X_FORWARDED_FOR, &format!("{chain}, {client_host}"));
        }
    }

    if config.forward_proto && absent(headers, &X_FORWARDED_PROTO) {
        set(headers, X_FORWARDED_PROTO, proto);
    }

    if config.forward_host && absent(headers, &X_FORWARDED_HOST) {
        if let Some(host) = &host_value {
            set(headers, X_FORWARDED_HOST, host);
        }
    }

    if let Some(port) = conn.local_port {
        if absent(headers, &X_FORWARDED_PORT) {
            set(headers, X_FORWARDED_PORT, &port.to_string());
        }
    }

    let mut forwarded = headers
        .get(header::FORWARDED)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("for={client_host}; proto={proto}"));
    if let Some(local_ip) = config.local_ip.as_deref().filter(|ip| !ip.is_empty()) {
        forwarded.push_str("; by=");
        forwarded.push_str(local_ip);
    }
    set(headers, header::FORWARDED, &forwarded);

    if let Some(name) = configured_name(&config.tls_header) {
        if conn.tls {
            set(headers, name, &config.tls_header_value);
        } else {
            headers.remove(name);
        }
    }

    if let Some(name) = configured_name(&config.request_id_header) {
        if absent(headers, &name) {
            set(headers, name, &Uuid::new_v4().to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(addr: &str) -> ClientConn {
        ClientConn {
            remote_addr: addr.into(),
            local_port: Some(9999),
            tls: false,
        }
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/foo")
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .unwrap()
    }

    fn get<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
        req.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn splits_addresses() {
        assert_eq!(split_host_port("1.2.3.4:5678"), Ok(("1.2.3.4", "5678")));
        assert_eq!(split_host_port("[::1]:80"), Ok(("::1", "80")));
        assert_eq!(split_host_port("localhost:80"), Ok(("localhost", "80")));
        assert!(split_host_port("1.2.3.4").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("[::1]80").is_err());
        assert!(split_host_port("").is_err());
    }

    #[test]
    fn error_names_address() {
        let err = split_host_port("garbage").unwrap_err();
        assert_eq!(err.to_string(), "cannot parse garbage");
    }

    #[test]
    fn adds_forwarding_headers() {
        let mut req = request();
        rewrite(&mut req, &conn("1.2.3.4:5555"), &HeaderConfig::default()).unwrap();

        assert_eq!(get(&req, "x-forwarded-for"), Some("1.2.3.4"));
        assert_eq!(get(&req, "x-real-ip"), Some("1.2.3.4"));
        assert_eq!(get(&req, "x-forwarded-proto"), Some("http"));
        assert_eq!(get(&req, "x-forwarded-host"), Some("example.com"));
        assert_eq!(get(&req, "x-forwarded-port"), Some("9999"));
        assert_eq!(get(&req, "forwarded"), Some("for=1.2.3.4; proto=http"));
    }

    #[test]
    fn appends_to_existing_chain_and_keeps_existing_values() {
        let mut req = request();
        let h = req.headers_mut();
        h.insert("x-forwarded-for", "9.9.9.9".parse().unwrap());
        h.insert("x-forwarded-proto", "https".parse().unwrap());
        h.insert("x-forwarded-host", "edge.example.com".parse().unwrap());
        h.insert("x-real-ip", "9.9.9.9".parse().unwrap());

        rewrite(&mut req, &conn("1.2.3.4:5555"), &HeaderConfig::default()).unwrap();

        assert_eq!(get(&req, "x-forwarded-for"), Some("9.9.9.9, 1.2.3.4"));
        assert_eq!(get(&req, "x-forwarded-proto"), Some("https"));
        assert_eq!(get(&req, "x-forwarded-host"), Some("edge.example.com"));
        assert_eq!(get(&req, "x-real-ip"), Some("9.9.9.9"));
    }

    #[test]
    fn flags_disable_headers() {
        let mut req = request();
        let config = HeaderConfig {
            forward_for: false,
            forward_host: false,
            forward_proto: false,
            ..HeaderConfig::default()
        };
        rewrite(&mut req, &conn("1.2.3.4:5555"), &config).unwrap();

        assert!(get(&req, "x-forwarded-for").is_none());
        assert!(get(&req, "x-forwarded-host").is_none());
        assert!(get(&req, "x-forwarded-proto").is_none());
        assert_eq!(get(&req, "x-real-ip"), Some("1.2.3.4"));
    }

    #[test]
    fn websocket_over_tls_uses_wss() {
        let mut req = request();
        req.headers_mut()
            .insert(header::UPGRADE, "websocket".parse().unwrap());
        let mut c = conn("[2001:db8::1]:4000");
        c.tls = true;
        let config = HeaderConfig {
            local_ip: Some("10.1.1.1".into()),
            tls_header: Some("X-Tls".into()),
            tls_header_value: "on".into(),
            ..HeaderConfig::default()
        };
        rewrite(&mut req, &c, &config).unwrap();

        assert_eq!(get(&req, "x-forwarded-proto"), Some("wss"));
        assert_eq!(get(&req, "x-forwarded-for"), Some("2001:db8::1"));
        assert_eq!(
            get(&req, "forwarded"),
            Some("for=2001:db8::1; proto=wss; by=10.1.1.1")
        );
        assert_eq!(get(&req, "x-tls"), Some("on"));
    }

    #[test]
    fn tls_header_removed_on_plain_connections() {
        let mut req = request();
        req.headers_mut().insert("x-tls", "spoofed".parse().unwrap());
        let config = HeaderConfig {
            tls_header: Some("X-Tls".into()),
            tls_header_value: "on".into(),
            ..HeaderConfig::default()
        };
        rewrite(&mut req, &conn("1.2.3.4:1"), &config).unwrap();
        assert!(get(&req, "x-tls").is_none());
    }

    #[test]
    fn client_ip_and_request_id_headers() {
        let mut req = request();
        let config = HeaderConfig {
            client_ip_header: Some("X-Client-Ip".into()),
            request_id_header: Some("X-Request-Id".into()),
            ..HeaderConfig::default()
        };
        rewrite(&mut req, &conn("1.2.3.4:1"), &config).unwrap();

        assert_eq!(get(&req, "x-client-ip"), Some("1.2.3.4"));
        let id = get(&req, "x-request-id").unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        // An existing request ID is kept.
        let mut req = request();
        req.headers_mut().insert("x-request-id", "abc".parse().unwrap());
        rewrite(&mut req, &conn("1.2.3.4:1"), &config).unwrap();
        assert_eq!(get(&req, "x-request-id"), Some("abc"));
    }

    #[test]
    fn malformed_address_leaves_headers_untouched() {
        let mut req = request();
        let err = rewrite(&mut req, &conn("not-an-address"), &HeaderConfig::default()).unwrap_err();
        assert_eq!(err.addr, "not-an-address");
        assert!(get(&req, "x-forwarded-for").is_none());
    }
}

//! Per-request orchestration.
//!
//! # Data Flow
//! ```text
//! request
//!     → resolve target          (none: no-route status, counter, stop)
//!     → rewrite headers         (bad client address: 500, stop)
//!     → strip path prefix
//!     → classify, build engine  (gzip wrap unless tunnel)
//!     → serve                   (awaited for the whole exchange)
//!     → target timer, request timer, status timer + access log
//! ```
//!
//! The dispatcher holds only shared read-only handles; everything per
//! request lives on the stack of the request task.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::http::uri::{PathAndQuery, Uri};
use axum::http::{Request, StatusCode};
use thiserror::Error;

use crate::config::{HeaderConfig, ProxyConfig};
use crate::observability::access_log::{AccessLogger, RequestSummary};
use crate::observability::metrics::{Counter, Registry};
use crate::proxy::buffered::BufferedEngine;
use crate::proxy::classify::Classification;
use crate::proxy::compression::{GzipContentTypes, GzipEngine};
use crate::proxy::engine::{empty_response, text_response, Engine, ResponseWriter};
use crate::proxy::headers::{self, ClientConn};
use crate::proxy::instrument::{Instrumentation, Timing};
use crate::proxy::transport::Transport;
use crate::proxy::tunnel::TunnelEngine;
use crate::routing::{Resolve, Target};

/// The dispatcher cannot be built from what it was given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("no target resolver configured")]
    MissingResolver,

    #[error("no outbound transport configured")]
    MissingTransport,

    #[error("invalid no-route status {0}")]
    InvalidNoRouteStatus(u16),

    #[error("flush interval must be positive")]
    ZeroFlushInterval,
}

/// Static dispatch settings, fixed for the lifetime of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub no_route_status: StatusCode,
    pub flush_interval: Duration,
    /// `None` disables compression.
    pub gzip_content_types: Option<GzipContentTypes>,
    pub headers: HeaderConfig,
    pub tunnel_dial_timeout: Duration,
    /// Aggregate request timer name; empty disables it.
    pub request_timer: String,
    pub noroute_counter: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            no_route_status: StatusCode::NOT_FOUND,
            flush_interval: Duration::from_secs(1),
            gzip_content_types: None,
            headers: HeaderConfig::default(),
            tunnel_dial_timeout: Duration::from_secs(10),
            request_timer: "requests".into(),
            noroute_counter: "notfound".into(),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigurationError> {
        let proxy = &config.proxy;
        let no_route_status = StatusCode::from_u16(proxy.no_route_status)
            .map_err(|_| ConfigurationError::InvalidNoRouteStatus(proxy.no_route_status))?;

        Ok(Self {
            no_route_status,
            flush_interval: Duration::from_millis(proxy.flush_interval_ms),
            gzip_content_types: proxy.gzip_content_types.as_ref().map(GzipContentTypes::new),
            headers: config.headers.clone(),
            tunnel_dial_timeout: Duration::from_secs(config.timeouts.tunnel_dial_secs),
            request_timer: proxy.request_timer.clone(),
            noroute_counter: proxy.noroute_counter.clone(),
        })
    }
}

/// Builds a [`Dispatcher`], rejecting missing collaborators.
#[derive(Default)]
pub struct DispatcherBuilder {
    settings: DispatchSettings,
    resolver: Option<Arc<dyn Resolve>>,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<Registry>>,
    access_log: Option<Arc<dyn AccessLogger>>,
}

impl DispatcherBuilder {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to a fresh registry.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn access_log(mut self, logger: Arc<dyn AccessLogger>) -> Self {
        self.access_log = Some(logger);
        self
    }

    pub fn build(self) -> Result<Dispatcher, ConfigurationError> {
        let resolver = self.resolver.ok_or(ConfigurationError::MissingResolver)?;
        let transport = self.transport.ok_or(ConfigurationError::MissingTransport)?;
        if self.settings.flush_interval.is_zero() {
            return Err(ConfigurationError::ZeroFlushInterval);
        }

        let registry = self.registry.unwrap_or_default();
        let requests = (!self.settings.request_timer.is_empty())
            .then(|| registry.get_timer(&self.settings.request_timer));
        let noroute = registry.get_counter(&self.settings.noroute_counter);

        Ok(Dispatcher {
            instrumentation: Instrumentation::new(registry, requests, self.access_log),
            settings: self.settings,
            resolver,
            transport,
            noroute,
        })
    }
}

/// Routes each inbound request to its target through the matching engine.
pub struct Dispatcher {
    settings: DispatchSettings,
    resolver: Arc<dyn Resolve>,
    transport: Arc<dyn Transport>,
    instrumentation: Instrumentation,
    noroute: Counter,
}

impl Dispatcher {
    pub fn builder(settings: DispatchSettings) -> DispatcherBuilder {
        DispatcherBuilder::new(settings)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.instrumentation.registry()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Serve one request. Completes when the exchange is over.
    pub async fn dispatch(&self, mut req: Request<Body>, mut writer: ResponseWriter) {
        let Some(target) = self.resolver.resolve(&req) else {
            tracing::debug!(method = %req.method(), uri = %req.uri(), "No route");
            writer.write(empty_response(self.settings.no_route_status));
            self.noroute.increment(1);
            return;
        };

        let conn = req.extensions().get::<ClientConn>().cloned().unwrap_or_default();
        if let Err(e) = headers::rewrite(&mut req, &conn, &self.settings.headers) {
            tracing::warn!(error = %e, "Rejecting request");
            writer.write(text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            return;
        }

        strip_prefix(&mut req, target.strip_path());

        let class = Classification::of(req.headers());
        let mut engine = self.engine_for(class, &target);
        tracing::debug!(
            route = target.service(),
            upstream = %target.url(),
            engine = %engine.describe(),
            "Dispatching"
        );

        let summary = RequestSummary::new(&req, &conn.remote_addr);
        let started = Instant::now();
        let start = SystemTime::now();

        engine.serve(req, writer).await;

        let timing = Timing {
            start,
            end: SystemTime::now(),
            elapsed: started.elapsed(),
        };
        let captured = engine.capture().and_then(|c| c.captured());
        self.instrumentation.record(&target, timing, &summary, captured);
    }

    /// Engine for one classified request, decorated as configured.
    pub(crate) fn engine_for(&self, class: Classification, target: &Target) -> Box<dyn Engine> {
        let destination = target.url().clone();
        let engine: Box<dyn Engine> = match class {
            Classification::Tunnel => {
                if self.settings.gzip_content_types.is_some() {
                    tracing::debug!("Compression skipped for tunnel");
                }
                return Box::new(TunnelEngine::new(destination, self.settings.tunnel_dial_timeout));
            }
            Classification::Stream | Classification::Buffered => Box::new(BufferedEngine::new(
                destination,
                self.transport.clone(),
                class.flush_interval(self.settings.flush_interval),
            )),
        };

        match &self.settings.gzip_content_types {
            Some(types) => Box::new(GzipEngine::new(engine, types.clone())),
            None => engine,
        }
    }
}

/// Remove `prefix` from the request path when it is a literal prefix.
///
/// The query string survives; a path left empty becomes `/`.
fn strip_prefix(req: &mut Request<Body>, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    let Some(rest) = req.uri().path().strip_prefix(prefix) else {
        return;
    };

    let path = if rest.is_empty() { "/" } else { rest };
    let path_and_query = match req.uri().query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_owned(),
    };

    let mut parts = req.uri().clone().into_parts();
    match PathAndQuery::try_from(path_and_query) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(e) => {
            tracing::debug!(error = %e, "Keeping unstripped path");
            return;
        }
    }
    match Uri::from_parts(parts) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => tracing::debug!(error = %e, "Keeping unstripped path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::access_log::AccessEvent;
    use crate::proxy::transport::TransportError;
    use crate::routing::target::timer_name;
    use axum::http::{header, Response};
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct StubTransport {
        seen: Mutex<Vec<Uri>>,
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
            self.seen.lock().unwrap().push(req.uri().clone());
            if req.uri().path() == "/hang" {
                return std::future::pending().await;
            }
            let status = if req.uri().path() == "/missing-upstream" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            Ok(Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("ok"))
                .unwrap())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, String, u16)>>,
    }

    impl AccessLogger for Recorder {
        fn log(&self, event: &AccessEvent<'_>) {
            self.events.lock().unwrap().push((
                event.upstream_addr.to_owned(),
                event.request.uri.to_string(),
                event.response.status.as_u16(),
            ));
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        transport: Arc<StubTransport>,
        recorder: Arc<Recorder>,
        target: Arc<Target>,
        dispatcher: Dispatcher,
    }

    fn fixture(settings: DispatchSettings, strip: &str, routed: bool) -> Fixture {
        let registry = Arc::new(Registry::new());
        let url = Url::parse("http://backend1").unwrap();
        let target = Arc::new(Target::new(
            "api",
            url.clone(),
            strip,
            registry.get_timer(&timer_name("api", None, "/api", &url)),
        ));
        let transport = Arc::new(StubTransport::default());
        let recorder = Arc::new(Recorder::default());

        let resolved = target.clone();
        let resolver =
            move |_: &Request<Body>| -> Option<Arc<Target>> { routed.then(|| resolved.clone()) };

        let dispatcher = Dispatcher::builder(settings)
            .resolver(Arc::new(resolver))
            .transport(transport.clone())
            .registry(registry.clone())
            .access_log(recorder.clone())
            .build()
            .unwrap();

        Fixture {
            registry,
            transport,
            recorder,
            target,
            dispatcher,
        }
    }

    fn request(uri: &str, remote: &str) -> Request<Body> {
        let mut req = Request::builder()
            .uri(uri)
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ClientConn {
            remote_addr: remote.into(),
            local_port: Some(9999),
            tls: false,
        });
        req
    }

    async fn run(f: &Fixture, req: Request<Body>) -> Response<Body> {
        let (writer, rx) = ResponseWriter::channel();
        f.dispatcher.dispatch(req, writer).await;
        rx.await.unwrap()
    }

    fn status_timers(registry: &Registry) -> Vec<String> {
        registry
            .timers()
            .into_keys()
            .filter(|k| k.starts_with("http.status."))
            .collect()
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = Dispatcher::builder(DispatchSettings::default())
            .transport(Arc::new(StubTransport::default()))
            .build()
            .err();
        assert_eq!(err, Some(ConfigurationError::MissingResolver));

        let resolver = |_: &Request<Body>| -> Option<Arc<Target>> { None };
        let err = Dispatcher::builder(DispatchSettings::default())
            .resolver(Arc::new(resolver))
            .build()
            .err();
        assert_eq!(err, Some(ConfigurationError::MissingTransport));
    }

    #[test]
    fn settings_reject_bad_values() {
        let mut config = ProxyConfig::default();
        config.proxy.no_route_status = 42;
        assert_eq!(
            DispatchSettings::from_config(&config).err(),
            Some(ConfigurationError::InvalidNoRouteStatus(42))
        );

        let mut config = ProxyConfig::default();
        config.proxy.flush_interval_ms = 0;
        let settings = DispatchSettings::from_config(&config).unwrap();
        let resolver = |_: &Request<Body>| -> Option<Arc<Target>> { None };
        let err = Dispatcher::builder(settings)
            .resolver(Arc::new(resolver))
            .transport(Arc::new(StubTransport::default()))
            .build()
            .err();
        assert_eq!(err, Some(ConfigurationError::ZeroFlushInterval));
    }

    #[tokio::test]
    async fn strips_prefix_and_records_everything() {
        let f = fixture(DispatchSettings::default(), "/api", true);
        let response = run(&f, request("/api/foo?x=1", "1.2.3.4:5555")).await;
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            f.transport.seen.lock().unwrap()[0].to_string(),
            "http://backend1/foo?x=1"
        );
        assert_eq!(f.target.timer().count(), 1);
        assert_eq!(f.registry.get_timer("requests").count(), 1);
        assert_eq!(f.registry.find_timer("http.status.200").unwrap().count(), 1);
        assert_eq!(
            *f.recorder.events.lock().unwrap(),
            vec![("backend1".to_owned(), "/foo?x=1".to_owned(), 200)]
        );
    }

    #[tokio::test]
    async fn client_gone_before_upstream_head_records_timers_only() {
        let f = fixture(DispatchSettings::default(), "/api", true);
        let (writer, rx) = ResponseWriter::channel();
        drop(rx);

        tokio::time::timeout(
            Duration::from_secs(2),
            f.dispatcher.dispatch(request("/api/hang", "1.2.3.4:5555"), writer),
        )
        .await
        .expect("dispatch returns once the client is gone");

        assert_eq!(f.target.timer().count(), 1);
        assert_eq!(f.registry.get_timer("requests").count(), 1);
        assert!(status_timers(&f.registry).is_empty());
        assert!(f.recorder.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefix_must_match_literally() {
        let f = fixture(DispatchSettings::default(), "/api", true);
        run(&f, request("/API/foo", "1.2.3.4:5555")).await;
        run(&f, request("/api", "1.2.3.4:5555")).await;

        let seen = f.transport.seen.lock().unwrap();
        assert_eq!(seen[0].path(), "/API/foo");
        assert_eq!(seen[1].path(), "/");
    }

    #[tokio::test]
    async fn upstream_status_is_keyed() {
        let f = fixture(DispatchSettings::default(), "", true);
        run(&f, request("/missing-upstream", "1.2.3.4:5555")).await;
        assert_eq!(f.registry.find_timer("http.status.404").unwrap().count(), 1);
    }

    #[tokio::test]
    async fn no_route_uses_configured_status() {
        let settings = DispatchSettings {
            no_route_status: StatusCode::SERVICE_UNAVAILABLE,
            ..DispatchSettings::default()
        };
        let f = fixture(settings, "", false);
        let response = run(&f, request("/missing", "1.2.3.4:5555")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
        assert_eq!(f.registry.get_counter("notfound").count(), 1);
        assert_eq!(f.registry.get_timer("requests").count(), 0);
        assert!(f.recorder.events.lock().unwrap().is_empty());
        assert!(f.transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_client_address_is_rejected_before_forwarding() {
        let f = fixture(DispatchSettings::default(), "", true);
        let response = run(&f, request("/foo", "garbage")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"cannot parse garbage");
        assert_eq!(f.target.timer().count(), 0);
        assert_eq!(f.registry.get_timer("requests").count(), 0);
        assert!(status_timers(&f.registry).is_empty());
        assert!(f.transport.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn engines_follow_classification() {
        let settings = DispatchSettings {
            flush_interval: Duration::from_millis(500),
            ..DispatchSettings::default()
        };
        let f = fixture(settings, "", true);
        let d = &f.dispatcher;

        assert_eq!(
            d.engine_for(Classification::Stream, &f.target).describe(),
            "buffered(flush=500ms)"
        );
        assert_eq!(
            d.engine_for(Classification::Buffered, &f.target).describe(),
            "buffered(flush=0ns)"
        );
        let tunnel = d.engine_for(Classification::Tunnel, &f.target);
        assert_eq!(tunnel.describe(), "tunnel");
        assert!(tunnel.capture().is_none());
    }

    #[test]
    fn gzip_wraps_everything_but_tunnels() {
        let settings = DispatchSettings {
            gzip_content_types: Some(GzipContentTypes::new(["text/plain"])),
            ..DispatchSettings::default()
        };
        let f = fixture(settings, "", true);
        let d = &f.dispatcher;

        let buffered = d.engine_for(Classification::Buffered, &f.target);
        assert_eq!(buffered.describe(), "gzip(buffered(flush=0ns))");
        assert!(buffered.capture().is_some());
        assert_eq!(
            d.engine_for(Classification::Tunnel, &f.target).describe(),
            "tunnel"
        );
    }

    #[tokio::test]
    async fn compressed_requests_still_capture_status() {
        let settings = DispatchSettings {
            gzip_content_types: Some(GzipContentTypes::new(["text/plain"])),
            ..DispatchSettings::default()
        };
        let f = fixture(settings, "", true);
        let mut req = request("/foo", "1.2.3.4:5555");
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());

        let response = run(&f, req).await;
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(f.registry.find_timer("http.status.200").unwrap().count(), 1);
        assert_eq!(f.recorder.events.lock().unwrap().len(), 1);
    }
}

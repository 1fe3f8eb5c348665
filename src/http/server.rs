//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the dispatcher and its collaborators from configuration
//! - Create the Axum router sending every path to the dispatcher
//! - Record client connection facts on each request
//! - Swap the route table when a new configuration arrives
//! - Serve plain TCP or TLS until shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::validation::validate_config;
use crate::config::ProxyConfig;
use crate::observability::access_log::TracingAccessLogger;
use crate::observability::metrics::Registry;
use crate::proxy::engine::text_response;
use crate::proxy::{ClientConn, ConfigurationError, DispatchSettings, Dispatcher, HttpTransport, ResponseWriter};
use crate::routing::{RouteTable, SharedRouteTable};

/// How long TLS connections may drain after shutdown is triggered.
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    local_port: Option<u16>,
    tls: bool,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
    routes: Arc<SharedRouteTable>,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server with its own metrics registry.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigurationError> {
        Self::with_registry(config, Arc::new(Registry::new()))
    }

    /// Create a server recording into `registry`.
    pub fn with_registry(config: ProxyConfig, registry: Arc<Registry>) -> Result<Self, ConfigurationError> {
        let settings = DispatchSettings::from_config(&config)?;
        let table = RouteTable::from_config(&config.routes, config.proxy.strategy, &registry);
        let routes = Arc::new(SharedRouteTable::new(table));
        let transport = Arc::new(HttpTransport::new(&config.timeouts));

        let mut builder = Dispatcher::builder(settings)
            .resolver(routes.clone())
            .transport(transport)
            .registry(registry);
        if config.observability.access_log {
            builder = builder.access_log(Arc::new(TracingAccessLogger::new(
                config.observability.access_log_format,
            )));
        }
        let dispatcher = Arc::new(builder.build()?);

        tracing::info!(
            routes = routes.load().routes().len(),
            gzip = config.proxy.gzip_content_types.is_some(),
            "Dispatcher ready"
        );

        Ok(Self {
            dispatcher,
            routes,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    pub fn routes(&self) -> &Arc<SharedRouteTable> {
        &self.routes
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn build_router(&self, local_port: Option<u16>, tls: bool) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            local_port,
            tls,
        };
        Router::new()
            .route("/{*path}", any(dispatch_handler))
            .route("/", any(dispatch_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    fn spawn_reloader(&self, config_updates: mpsc::UnboundedReceiver<ProxyConfig>, shutdown: broadcast::Receiver<()>) {
        tokio::spawn(reload_routes(
            self.routes.clone(),
            self.dispatcher.registry().clone(),
            config_updates,
            shutdown,
        ));
    }

    /// Serve plain HTTP on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        self.spawn_reloader(config_updates, shutdown.resubscribe());
        let app = self
            .build_router(Some(addr.port()), false)
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` until `shutdown` fires.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        self.spawn_reloader(config_updates, shutdown.resubscribe());
        let app = self
            .build_router(Some(addr.port()), true)
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutdown signal received");
            drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Replace the route table with each valid configuration received.
///
/// Dispatch settings are not reloaded.
async fn reload_routes(
    routes: Arc<SharedRouteTable>,
    registry: Arc<Registry>,
    mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            update = config_updates.recv() => {
                let Some(config) = update else { return };
                if let Err(errors) = validate_config(&config) {
                    for e in &errors {
                        tracing::error!(error = %e, "Rejected reloaded configuration");
                    }
                    continue;
                }
                let table = RouteTable::from_config(&config.routes, config.proxy.strategy, &registry);
                tracing::info!(routes = table.routes().len(), "Route table reloaded");
                routes.store(table);
            }
        }
    }
}

/// Hand the request to the dispatcher and return the first response it writes.
///
/// Dispatch keeps running in its own task after the head is returned, so
/// bodies, streams and tunnels continue while the client reads.
async fn dispatch_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Response {
    request.extensions_mut().insert(ClientConn {
        remote_addr: remote.to_string(),
        local_port: state.local_port,
        tls: state.tls,
    });

    let (writer, response) = ResponseWriter::channel();
    let dispatcher = state.dispatcher.clone();
    // Runs past the handler so the body relay and instrumentation finish; keeps the request span.
    tokio::spawn(async move { dispatcher.dispatch(request, writer).await }.in_current_span());

    match response.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("Dispatcher finished without a response");
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

//! Pooled outbound transport.
//!
//! The buffered engine sends every upstream request through a [`Transport`].
//! The transport owns the connection pool and its timeouts.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;

use crate::config::TimeoutConfig;

/// Upstream request failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("no response headers from upstream within {0:?}")]
    Timeout(Duration),
}

/// Executes a request against an upstream and returns its response.
///
/// Shared by all request tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError>;
}

/// HTTP/1.1 transport backed by the hyper connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Body>,
    response_header_timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(config: &TimeoutConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.connect_secs)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(connector);

        let response_header_timeout =
            (config.response_header_secs > 0).then(|| Duration::from_secs(config.response_header_secs));

        Self {
            client,
            response_header_timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let pending = self.client.request(req);
        let response = match self.response_header_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| TransportError::Timeout(limit))??,
            None => pending.await?,
        };
        Ok(response.map(Body::new))
    }
}

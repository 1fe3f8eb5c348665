//! Forwarding engine contracts.
//!
//! An engine is built per request, serves it, and optionally reports the
//! upstream response it received. Decorators wrap engines and must forward
//! [`Engine::capture`] so instrumentation sees through them.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Response, StatusCode, Version};
use tokio::sync::oneshot;

/// Upstream response head captured by an engine.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Optional engine capability: report the upstream response.
pub trait CaptureResponse: Send + Sync {
    /// `None` when no upstream response was received.
    fn captured(&self) -> Option<&CapturedResponse>;
}

/// A request-scoped forwarding engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Forward the request and write the response.
    ///
    /// Returns once the exchange is over: the body has been relayed, the
    /// tunnel closed, or the client went away.
    async fn serve(&mut self, req: axum::http::Request<Body>, writer: ResponseWriter);

    /// The capture capability, if this engine has it.
    fn capture(&self) -> Option<&dyn CaptureResponse> {
        None
    }

    /// Short description for logs, e.g. `buffered(flush=0ns)`.
    fn describe(&self) -> String;
}

/// One-shot handle for the response to the client.
///
/// The response can be written at most once; the body keeps streaming after
/// the head has been handed over.
#[derive(Debug)]
pub struct ResponseWriter {
    tx: Option<oneshot::Sender<Response<Body>>>,
}

impl ResponseWriter {
    /// A writer and the receiver the server side awaits.
    pub fn channel() -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Hand the response to the client side.
    ///
    /// Returns `false` if a response was already written or the client is gone.
    pub fn write(&mut self, response: Response<Body>) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::warn!(status = %response.status(), "Response already written, dropping");
                false
            }
        }
    }

    pub fn is_written(&self) -> bool {
        self.tx.is_none()
    }

    /// Resolves once the client side has dropped its receiver.
    ///
    /// Never resolves after the response has been written.
    pub async fn closed(&mut self) {
        match self.tx.as_mut() {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

/// A response with an empty body.
pub fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// A plain-text response.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including those named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

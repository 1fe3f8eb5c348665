//! Gzip decorator for forwarding engines.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::{header, Request, Response, StatusCode};
use tower::{Layer, ServiceExt};
use tower_http::compression::predicate::Predicate;
use tower_http::compression::CompressionLayer;

use crate::proxy::engine::{empty_response, CaptureResponse, Engine, ResponseWriter};

/// Media types eligible for gzip, compared without parameters and case.
#[derive(Debug, Clone, Default)]
pub struct GzipContentTypes {
    types: Arc<HashSet<String>>,
}

impl GzipContentTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let types = types
            .into_iter()
            .map(|t| media_type(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            types: Arc::new(types),
        }
    }

    pub fn matches(&self, content_type: &str) -> bool {
        self.types.contains(&media_type(content_type))
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl Predicate for GzipContentTypes {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| self.matches(ct))
    }
}

/// Compresses the response of the wrapped engine.
///
/// The encoding is negotiated against the client's `Accept-Encoding`;
/// responses that already carry a `Content-Encoding` pass through.
pub struct GzipEngine {
    inner: Box<dyn Engine>,
    content_types: GzipContentTypes,
}

impl GzipEngine {
    pub fn new(inner: Box<dyn Engine>, content_types: GzipContentTypes) -> Self {
        Self {
            inner,
            content_types,
        }
    }
}

async fn compress(
    response: Response<Body>,
    accept_encoding: Option<header::HeaderValue>,
    content_types: GzipContentTypes,
) -> Response<Body> {
    let mut negotiation = Request::new(());
    if let Some(value) = accept_encoding {
        negotiation.headers_mut().insert(header::ACCEPT_ENCODING, value);
    }

    let mut slot = Some(response);
    let upstream = tower::service_fn(move |_: Request<()>| {
        let response = slot
            .take()
            .unwrap_or_else(|| empty_response(StatusCode::INTERNAL_SERVER_ERROR));
        std::future::ready(Ok::<_, Infallible>(response))
    });

    let service = CompressionLayer::new()
        .gzip(true)
        .compress_when(content_types)
        .layer(upstream);

    match service.oneshot(negotiation).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

#[async_trait]
impl Engine for GzipEngine {
    async fn serve(&mut self, req: Request<Body>, mut writer: ResponseWriter) {
        let accept_encoding = req.headers().get(header::ACCEPT_ENCODING).cloned();
        let content_types = self.content_types.clone();
        let (inner_writer, inner_rx) = ResponseWriter::channel();

        // Dropping `inner_rx` when the client leaves lets the inner engine see it.
        let relay = async move {
            let response = tokio::select! {
                _ = writer.closed() => return,
                response = inner_rx => response,
            };
            if let Ok(response) = response {
                writer.write(compress(response, accept_encoding, content_types).await);
            }
        };

        tokio::join!(self.inner.serve(req, inner_writer), relay);
    }

    fn capture(&self) -> Option<&dyn CaptureResponse> {
        self.inner.capture()
    }

    fn describe(&self) -> String {
        format!("gzip({})", self.inner.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::engine::CapturedResponse;
    use axum::http::Version;
    use std::io::Read;

    struct FixedEngine {
        content_type: &'static str,
        content_encoding: Option<&'static str>,
        captured: Option<CapturedResponse>,
    }

    impl FixedEngine {
        fn new(content_type: &'static str) -> Self {
            Self {
                content_type,
                content_encoding: None,
                captured: None,
            }
        }
    }

    #[async_trait]
    impl Engine for FixedEngine {
        async fn serve(&mut self, _req: Request<Body>, mut writer: ResponseWriter) {
            let mut builder = Response::builder().header(header::CONTENT_TYPE, self.content_type);
            if let Some(enc) = self.content_encoding {
                builder = builder.header(header::CONTENT_ENCODING, enc);
            }
            let response = builder.body(Body::from("hello ".repeat(64))).unwrap();
            self.captured = Some(CapturedResponse {
                status: response.status(),
                version: Version::HTTP_11,
                headers: response.headers().clone(),
            });
            writer.write(response);
        }

        fn capture(&self) -> Option<&dyn CaptureResponse> {
            Some(self)
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    impl CaptureResponse for FixedEngine {
        fn captured(&self) -> Option<&CapturedResponse> {
            self.captured.as_ref()
        }
    }

    fn types() -> GzipContentTypes {
        GzipContentTypes::new(["text/plain", "Application/JSON"])
    }

    async fn run(engine: FixedEngine, accept: Option<&str>) -> (GzipEngine, Response<Body>) {
        let mut gzip = GzipEngine::new(Box::new(engine), types());
        let mut req = Request::builder();
        if let Some(accept) = accept {
            req = req.header(header::ACCEPT_ENCODING, accept);
        }
        let (writer, rx) = ResponseWriter::channel();
        gzip.serve(req.body(Body::empty()).unwrap(), writer).await;
        (gzip, rx.await.unwrap())
    }

    #[test]
    fn media_types_ignore_parameters_and_case() {
        let t = types();
        assert!(t.matches("text/plain"));
        assert!(t.matches("Text/Plain; charset=utf-8"));
        assert!(t.matches("application/json"));
        assert!(!t.matches("text/html"));
        assert!(!t.matches(""));
    }

    #[tokio::test]
    async fn compresses_listed_types() {
        let (gzip, response) = run(FixedEngine::new("text/plain; charset=utf-8"), Some("gzip")).await;
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&body[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello ".repeat(64));

        let captured = gzip.capture().and_then(|c| c.captured()).unwrap();
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(gzip.describe(), "gzip(fixed)");
    }

    #[tokio::test]
    async fn leaves_other_responses_alone() {
        let (_, response) = run(FixedEngine::new("image/png"), Some("gzip")).await;
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

        let (_, response) = run(FixedEngine::new("text/plain"), None).await;
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

        let mut engine = FixedEngine::new("text/plain");
        engine.content_encoding = Some("br");
        let (_, response) = run(engine, Some("gzip")).await;
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");
    }

    /// Holds the response until the client is gone.
    struct WaitingEngine;

    #[async_trait]
    impl Engine for WaitingEngine {
        async fn serve(&mut self, _req: Request<Body>, mut writer: ResponseWriter) {
            writer.closed().await;
        }

        fn describe(&self) -> String {
            "waiting".into()
        }
    }

    #[tokio::test]
    async fn client_close_reaches_inner_engine() {
        let mut gzip = GzipEngine::new(Box::new(WaitingEngine), types());
        let (writer, rx) = ResponseWriter::channel();
        drop(rx);

        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            gzip.serve(Request::new(Body::empty()), writer),
        )
        .await
        .expect("inner engine observes the closed client");
    }
}

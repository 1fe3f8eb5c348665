//! Buffered forwarding engine for plain HTTP and server-sent events.
//!
//! # Data Flow
//! ```text
//! client request → rewrite URI for the target → Transport::round_trip
//!     → response head captured, written to the client
//!     → body relayed through a write buffer:
//!         flushed when 32 KiB accumulate, at end of body,
//!         and on every flush tick when an interval is set
//! ```
//!
//! `serve` returns after the last byte has been handed to the client, the
//! client went away, or the upstream failed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Response, StatusCode, Uri, Version};
use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use url::Url;

use crate::proxy::engine::{
    strip_hop_by_hop, text_response, CaptureResponse, CapturedResponse, Engine, ResponseWriter,
};
use crate::proxy::transport::Transport;

/// Buffered bytes are written out once this much has accumulated.
const WRITE_BUFFER_SIZE: usize = 32 * 1024;

/// Chunks in flight between the relay and the client connection.
const CLIENT_CHANNEL_DEPTH: usize = 16;

type Chunk = Result<Bytes, io::Error>;

/// Forwards one request over the shared transport.
pub struct BufferedEngine {
    destination: Url,
    transport: Arc<dyn Transport>,
    flush_interval: Duration,
    captured: Option<CapturedResponse>,
}

impl BufferedEngine {
    /// `flush_interval` of zero disables periodic flushing.
    pub fn new(destination: Url, transport: Arc<dyn Transport>, flush_interval: Duration) -> Self {
        Self {
            destination,
            transport,
            flush_interval,
            captured: None,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    fn upstream_request(&self, req: Request<Body>) -> Result<Request<Body>, axum::http::Error> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(&self.destination, &parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        Ok(Request::from_parts(parts, body))
    }
}

/// Join the target URL with the request path and query.
///
/// Paths are joined with exactly one slash; queries are concatenated with `&`.
pub fn upstream_uri(destination: &Url, inbound: &Uri) -> Result<Uri, axum::http::Error> {
    let base = destination.path();
    let path = inbound.path();
    let joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    };

    let query = match (destination.query().filter(|q| !q.is_empty()), inbound.query()) {
        (Some(a), Some(b)) if !b.is_empty() => format!("?{a}&{b}"),
        (Some(a), _) => format!("?{a}"),
        (None, Some(b)) => format!("?{b}"),
        (None, None) => String::new(),
    };

    let authority = match (destination.host_str(), destination.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    };

    let path_and_query = PathAndQuery::try_from(format!("{joined}{query}"))?;
    Ok(Uri::builder()
        .scheme(destination.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?)
}

#[async_trait]
impl Engine for BufferedEngine {
    async fn serve(&mut self, req: Request<Body>, mut writer: ResponseWriter) {
        let upstream_req = match self.upstream_request(req) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(upstream = %self.destination, error = %e, "Cannot build upstream request");
                writer.write(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
                return;
            }
        };

        let result = tokio::select! {
            _ = writer.closed() => {
                tracing::debug!(upstream = %self.destination, "Client gone while awaiting upstream, dropping request");
                return;
            }
            result = self.transport.round_trip(upstream_req) => result,
        };
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(upstream = %self.destination, error = %e, "Upstream request failed");
                writer.write(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
                return;
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        self.captured = Some(CapturedResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers.clone(),
        });

        let (tx, rx) = mpsc::channel::<Chunk>(CLIENT_CHANNEL_DEPTH);
        if !writer.write(Response::from_parts(parts, Body::from_stream(receiver_stream(rx)))) {
            tracing::debug!(upstream = %self.destination, "Client gone before response head");
            return;
        }

        relay_body(body, tx, self.flush_interval).await;
    }

    fn capture(&self) -> Option<&dyn CaptureResponse> {
        Some(self)
    }

    fn describe(&self) -> String {
        format!("buffered(flush={:?})", self.flush_interval)
    }
}

impl CaptureResponse for BufferedEngine {
    fn captured(&self) -> Option<&CapturedResponse> {
        self.captured.as_ref()
    }
}

fn receiver_stream(rx: mpsc::Receiver<Chunk>) -> impl futures_util::Stream<Item = Chunk> + Send {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Send buffered bytes to the client. `false` if the client is gone.
async fn flush(tx: &mpsc::Sender<Chunk>, buf: &mut BytesMut) -> bool {
    if buf.is_empty() {
        return !tx.is_closed();
    }
    tx.send(Ok(buf.split().freeze())).await.is_ok()
}

/// Copy the upstream body to the client through a write buffer.
pub(crate) async fn relay_body(body: Body, tx: mpsc::Sender<Chunk>, flush_interval: Duration) {
    let mut upstream = body.into_data_stream();
    let mut buf = BytesMut::with_capacity(WRITE_BUFFER_SIZE);
    let mut ticker = (!flush_interval.is_zero()).then(|| {
        let mut t = tokio::time::interval(flush_interval);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Client closed, releasing upstream body");
                return;
            }
            _ = tick(&mut ticker) => {
                if !flush(&tx, &mut buf).await {
                    return;
                }
            }
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    if buf.len() >= WRITE_BUFFER_SIZE && !flush(&tx, &mut buf).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Upstream body failed mid-stream");
                    if flush(&tx, &mut buf).await {
                        let _ = tx.send(Err(io::Error::other(e))).await;
                    }
                    return;
                }
                None => {
                    flush(&tx, &mut buf).await;
                    return;
                }
            },
        }
    }
}

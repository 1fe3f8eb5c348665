//! Full-duplex relay for protocol upgrades.
//!
//! The engine dials its own connection to the target, replays the upgrade
//! request and, on `101 Switching Protocols`, splices the two upgraded
//! connections together until either side closes.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use url::Url;

use crate::proxy::engine::{empty_response, text_response, Engine, ResponseWriter};

#[derive(Debug, Error)]
enum TunnelError {
    #[error("target has no host")]
    NoHost,

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] axum::http::Error),
}

/// Relays an upgraded connection to one target.
pub struct TunnelEngine {
    destination: Url,
    dial_timeout: Duration,
}

impl TunnelEngine {
    pub fn new(destination: Url, dial_timeout: Duration) -> Self {
        Self {
            destination,
            dial_timeout,
        }
    }

    fn authority(&self) -> Result<(String, u16), TunnelError> {
        let host = self.destination.host_str().ok_or(TunnelError::NoHost)?;
        let port = self.destination.port_or_known_default().unwrap_or(80);
        Ok((host.trim_start_matches('[').trim_end_matches(']').to_owned(), port))
    }

    async fn dial(&self) -> Result<TcpStream, TunnelError> {
        let (host, port) = self.authority()?;
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TunnelError::DialTimeout(self.dial_timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send the upgrade request and return the upstream answer.
    async fn handshake(&self, req: Request<Body>) -> Result<Response<hyper::body::Incoming>, TunnelError> {
        let stream = self.dial().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "Upstream tunnel connection ended");
            }
        });

        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let origin_form = Uri::try_from(path).map_err(axum::http::Error::from)?;
        parts.uri = origin_form;
        Ok(sender.send_request(Request::from_parts(parts, body)).await?)
    }
}

async fn splice(client: OnUpgrade, upstream: OnUpgrade) -> Result<(u64, u64), TunnelError> {
    let (client, upstream) = tokio::try_join!(client, upstream)?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    Ok(tokio::io::copy_bidirectional(&mut client, &mut upstream).await?)
}

#[async_trait]
impl Engine for TunnelEngine {
    async fn serve(&mut self, mut req: Request<Body>, mut writer: ResponseWriter) {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let result = tokio::select! {
            _ = writer.closed() => {
                tracing::debug!(upstream = %self.destination, "Client gone during tunnel setup");
                return;
            }
            result = self.handshake(req) => result,
        };
        let mut response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(upstream = %self.destination, error = %e, "Tunnel setup failed");
                writer.write(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
                return;
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!(
                upstream = %self.destination,
                status = %response.status(),
                "Upstream refused upgrade"
            );
            writer.write(response.map(Body::new));
            return;
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let mut head = empty_response(StatusCode::SWITCHING_PROTOCOLS);
        *head.headers_mut() = response.headers().clone();
        if !writer.write(head) {
            return;
        }

        match splice(client_upgrade, upstream_upgrade).await {
            Ok((from_client, from_upstream)) => tracing::debug!(
                upstream = %self.destination,
                from_client,
                from_upstream,
                "Tunnel closed"
            ),
            Err(e) => tracing::debug!(upstream = %self.destination, error = %e, "Tunnel ended with error"),
        }
    }

    fn describe(&self) -> String {
        "tunnel".to_owned()
    }
}

//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway_dispatch::config::{ProxyConfig, RouteConfig};
use gateway_dispatch::http::HttpServer;
use gateway_dispatch::lifecycle::Shutdown;
use gateway_dispatch::observability::metrics::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Read the request head (up to the blank line) from a raw socket.
async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

async fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a mock backend that answers every request with `status` and `body`.
pub async fn start_mock_backend(status: u16, content_type: &'static str, body: &'static str) -> SocketAddr {
    start_programmable_backend(move |_head| async move { (status, content_type, body.to_string()) }).await
}

/// Start a backend whose response is computed from the raw request head.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, &'static str, String)> + Send + 'static,
{
    let (listener, addr) = local_listener().await;
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let head = read_head(&mut socket).await;
                        let (status, content_type, body) = f(head).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            content_type,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a backend that answers with its received request head as the body.
pub async fn start_echo_backend() -> SocketAddr {
    start_programmable_backend(|head| async move { (200, "text/plain", head) }).await
}

/// Start an event-stream backend: one event, a pause of `hold`, then the end.
pub async fn start_sse_backend(hold: Duration) -> SocketAddr {
    let (listener, addr) = local_listener().await;

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
                    )
                    .await;
                let _ = socket.write_all(b"9\r\ndata: 1\n\n\r\n").await;
                tokio::time::sleep(hold).await;
                let _ = socket.write_all(b"9\r\ndata: 2\n\n\r\n0\r\n\r\n").await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start a backend that reads the request and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let (listener, addr) = local_listener().await;

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let mut buf = [0u8; 64];
                // Hold the connection until the gateway hangs up.
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Start a websocket backend echoing every data frame.
pub async fn start_ws_echo_backend() -> SocketAddr {
    let (listener, addr) = local_listener().await;

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// A single-route configuration sending everything under `prefix` to `backend`.
pub fn route_config(prefix: &str, strip: Option<&str>, backend: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.observability.metrics_enabled = false;
    config.routes.push(RouteConfig {
        name: "svc".into(),
        host: None,
        path_prefix: prefix.into(),
        strip_path: strip.map(Into::into),
        targets: vec![format!("http://{backend}")],
        priority: 0,
    });
    config
}

/// A running gateway.
pub struct Gateway {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    pub shutdown: Shutdown,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Names of the registered status timers.
    pub fn status_timers(&self) -> Vec<String> {
        self.registry
            .timers()
            .into_keys()
            .filter(|name| name.starts_with("http.status."))
            .collect()
    }

    /// Count of the only per-target timer.
    pub fn target_count(&self) -> u64 {
        self.registry
            .timers()
            .into_iter()
            .filter(|(name, _)| name.starts_with("route."))
            .map(|(_, snap)| snap.count)
            .sum()
    }

    /// Poll until `check` holds; instrumentation runs after the body is sent.
    pub async fn eventually(&self, check: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..100 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check(self)
    }
}

/// Start the gateway on an ephemeral port.
pub async fn start_gateway(config: ProxyConfig) -> Gateway {
    let shutdown = Shutdown::new();
    let registry = Arc::new(Registry::new());
    let (_, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::with_registry(config, registry.clone()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    Gateway {
        addr,
        registry,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

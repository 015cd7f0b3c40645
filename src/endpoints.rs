//! Endpoint server for exposing metrics and health checks

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::metrics::metrics;
use crate::state::StateHandle;

/// Response produced for one request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn to_http(&self) -> String {
        let reason = match self.status {
            200 => "OK",
            404 => "Not Found",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            self.status,
            reason,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// `/health` is 200 only while streaming.
pub fn route(request_line: &str, state: &StateHandle) -> Reply {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/metrics" => match metrics().render() {
            Ok(body) => Reply {
                status: 200,
                content_type: "text/plain; version=0.0.4",
                body,
            },
            Err(e) => Reply::text(500, format!("failed to encode metrics: {e}")),
        },
        "/health" => {
            let current = state.get();
            let status = if state.is_streaming() { 200 } else { 503 };
            Reply::text(status, current.as_str())
        }
        _ => Reply::text(404, "not found"),
    }
}

/// Start the endpoint server
pub async fn endpoint_server(port: u16, state: StateHandle) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((mut socket, _peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let mut buf = [0; 1024];
                    match socket.read(&mut buf).await {
                        Ok(n) => {
                            let request = String::from_utf8_lossy(&buf[..n]);
                            let line = request.lines().next().unwrap_or_default();
                            let reply = route(line, &state);
                            let _ = socket.write_all(reply.to_http().as_bytes()).await;
                        }
                        Err(e) => {
                            tracing::error!("Failed to read from socket: {}", e);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

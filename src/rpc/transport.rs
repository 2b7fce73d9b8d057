//! Newline-delimited JSON over TCP. Each connection runs in its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, handler: MethodHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Open connections are
    /// closed with it.
    pub async fn listen(&self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Client connected");
                        let handler = Arc::clone(&self.handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                result = handle_connection(stream, peer, handler) => {
                                    if let Err(err) = result {
                                        debug!(peer = %peer, error = %err, "Connection error");
                                    }
                                }
                                _ = shutdown.cancelled() => {}
                            }
                            debug!(peer = %peer, "Client disconnected");
                        });
                    }
                    Err(err) => error!(error = %err, "Failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(peer = %peer, error = msg, "Invalid request");
                    Response::invalid_request(request.id.unwrap_or_default())
                } else if request.is_notification() {
                    debug!(peer = %peer, method = %request.method, "Notification received");
                    handler.handle(request).await;
                    continue;
                } else {
                    handler.handle(request).await
                }
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "Parse error");
                Response::parse_error()
            }
        };

        let mut json = serde_json::to_string(&response).map_err(io::Error::other)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
    }

    Ok(())
}

//! JSON-RPC 2.0 surface through which the UI drives the orchestrator.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener with newline-delimited framing
//! - `methods`: method table over the [`Orchestrator`]
//! - `client`: the other end, used by the CLI

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> io::Result<Self> {
        let transport = Transport::bind(addr, MethodHandler::new(orchestrator)).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) {
        self.transport.listen(shutdown).await
    }
}

//! HTTP server loop
//!
//! hyper accept loop for the filebase dispatcher: one tokio task per
//! connection, upgrades enabled so channel requests can switch protocols.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use filebase_server::{CapabilityRegistry, Dispatcher, HttpServer, ServeConfig};
//! use filebase_server::bank::BankConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         ServeConfig::new("./public"),
//!         Arc::new(CapabilityRegistry::new()),
//!         BankConfig::default(),
//!     ));
//!     let server = HttpServer::new(dispatcher);
//!     server.run("127.0.0.1:8080".parse().unwrap()).await.unwrap();
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use filebase_common::{FilebaseError, Result};

use crate::dispatch::{error_response, Dispatcher, HyperRequest, HyperResponse};

/// HTTP server for a filebase dispatcher.
pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        HttpServer { dispatcher }
    }

    /// Binds and serves forever.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FilebaseError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener.
    ///
    /// Useful for tests that bind an ephemeral port first.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| FilebaseError::Transport(format!("no local address: {}", e)))?;
        tracing::info!("filebase listening on {}", local);

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| FilebaseError::Transport(format!("accept failed: {}", e)))?;
            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Self::handle(dispatcher, req, Some(peer)).await }
                });

                // with_upgrades keeps the connection usable for channels
                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!("connection ended: {}", err);
                }
            });
        }
    }

    async fn handle(
        dispatcher: Arc<Dispatcher>,
        req: HyperRequest,
        peer: Option<SocketAddr>,
    ) -> std::result::Result<HyperResponse, std::convert::Infallible> {
        match dispatcher.dispatch(req, peer).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!("request failed: {}", e);
                Ok(error_response(&e))
            }
        }
    }
}

//! HTTP control surface
//!
//! A small HTTP/1 server for starting dumps and shows and listing sessions.
//! Connections beyond `limits.max_connections` are refused.

mod pages;
mod routes;

pub use pages::escape_html;
pub use routes::{error_response, form_field, redirect, text_response, Router};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::session::SessionController;
use crate::{Result, SiteDumpError};

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Control-surface server
pub struct ControlServer {
    router: Router,
    controller: Arc<SessionController>,
    connections: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    /// Create a server in front of `controller`
    #[must_use]
    pub fn new(controller: Arc<SessionController>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = Router::new(
            Arc::clone(&controller),
            config.limits.max_request_size,
            config.server.display_offset(),
        );

        Self {
            router,
            controller,
            connections: Arc::new(Semaphore::new(config.limits.max_connections)),
            shutdown_tx,
        }
    }

    /// Sender that stops the server when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or cannot be bound
    pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.listen_port)
            .parse()
            .map_err(|e| {
                SiteDumpError::ConfigError(format!(
                    "Invalid bind address {}:{}: {e}",
                    config.bind_address, config.listen_port
                ))
            })?;

        Ok(TcpListener::bind(addr).await?)
    }

    /// Bind the configured address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn run(self, config: &ServerConfig) -> Result<()> {
        let listener = Self::bind(config).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until Ctrl-C or a shutdown signal
    ///
    /// On shutdown, open connections are given [`SHUTDOWN_TIMEOUT_MS`] to
    /// finish and then the session controller is shut down.
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Control surface listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!("Connection limit reached, rejecting {}", peer_addr);
                                    drop(stream);
                                    continue;
                                }
                            };

                            let router = self.router.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            connections.spawn(async move {
                                let _permit = permit;
                                serve_connection(stream, peer_addr, router, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {}", e);
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // Graceful shutdown
        self.shutdown_tx.send(()).ok();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Connection cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        self.controller.shutdown().await;
        info!("Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let service = service_fn(move |request| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.handle(request).await) }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", peer_addr, e);
            }
        }
        _ = shutdown_rx.recv() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!("Connection from {} ended during shutdown: {}", peer_addr, e);
            }
        }
    }
}

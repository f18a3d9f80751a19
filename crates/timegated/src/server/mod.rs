//! Unix socket server for the timegate daemon.
//!
//! Accepts newline-delimited JSON connections, hands each one to a
//! `ConnectionHandler`, and fans enforcement directives out from the
//! engine's broadcast channel to every subscribed integration. Shutdown
//! is driven by a `CancellationToken`; the socket file is removed on the
//! way out.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept and delivery errors are logged and never stop the server

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, Subscriber, SubscriberWriter, SubscribersMap};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use timegate_protocol::DaemonReply;

use crate::engine::EngineHandle;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/timegated.sock";

/// Unix socket server: accept loop plus directive fan-out.
pub struct DaemonServer {
    socket_path: PathBuf,

    engine: EngineHandle,

    cancel_token: CancellationToken,

    /// Source of per-connection numbers for generated client ids
    connection_counter: AtomicU64,

    /// Subscribed clients, keyed by client id
    subscribers: SubscribersMap,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        engine: EngineHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            engine,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a server on [`DEFAULT_SOCKET_PATH`].
    pub fn with_default_path(engine: EngineHandle, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, engine, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until the cancellation token fires, then
    /// removes the socket file. Does not return before shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        self.spawn_directive_broadcaster();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => self.spawn_connection(stream),
                        // A failed accept leaves the listener usable
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Binds the listener, replacing a stale socket file and creating
    /// the parent directory when missing.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_err = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_err)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_err)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_err)
    }

    /// Hands an accepted stream to its own handler task. When the
    /// handler returns, the client is dropped from the subscriber map.
    fn spawn_connection(&self, stream: UnixStream) {
        let connection_number = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let engine = self.engine.clone();
        let subscribers = Arc::clone(&self.subscribers);

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                reader,
                writer,
                engine,
                Arc::clone(&subscribers),
                connection_number,
            );

            if let Some(id) = handler.run().await {
                if subscribers.write().await.remove(&id).is_some() {
                    debug!(client_id = %id, "Removed disconnected subscriber");
                }
            }
        });
    }

    /// Spawns the task that forwards engine directives to subscribers.
    fn spawn_directive_broadcaster(&self) {
        let mut directive_rx = self.engine.subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Directive broadcaster shutting down");
                        return;
                    }

                    received = directive_rx.recv() => match received {
                        Ok(directive) => {
                            deliver_to_subscribers(
                                &subscribers,
                                &DaemonReply::Directive { directive },
                            )
                            .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Directive broadcaster lagged, skipped directives");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Directive channel closed");
                            return;
                        }
                    },
                }
            }
        });
    }

    /// Returns the number of active subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn cleanup(&self) {
        self.subscribers.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Writes one reply line to every subscriber, dropping the ones whose
/// connection turns out to be dead.
async fn deliver_to_subscribers(subscribers: &SubscribersMap, reply: &DaemonReply) {
    let json = match serde_json::to_string(reply) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, "Failed to serialize directive");
            return;
        }
    };

    let mut dead = Vec::new();
    {
        let subs = subscribers.read().await;
        for (client_id, sub) in subs.iter() {
            let mut writer = sub.writer.lock().await;
            if let Err(e) = write_line(&mut *writer, &json).await {
                debug!(client_id = %client_id, error = %e, "Failed to send directive to subscriber");
                dead.push(client_id.clone());
            }
        }
    }

    if !dead.is_empty() {
        let mut subs = subscribers.write().await;
        for client_id in dead {
            subs.remove(&client_id);
            debug!(client_id = %client_id, "Removed failed subscriber");
        }
    }
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, json: &str) -> std::io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path() {
        assert_eq!(DEFAULT_SOCKET_PATH, "/tmp/timegated.sock");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }
}

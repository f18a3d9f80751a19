//! Per-client connection handling.
//!
//! One `ConnectionHandler` per accepted socket: it negotiates the
//! protocol version, then reads one JSON request per line and routes
//! each action to the engine. Clients that subscribe get their write
//! half registered in the shared subscriber map so the server can push
//! directives at them between replies.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use timegate_protocol::{Action, ClientRequest, DaemonReply, ErrorCode, ProtocolVersion};

use crate::engine::{EngineError, EngineHandle};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Information about a subscribed client
pub struct Subscriber {
    /// Writer for sending directives
    pub writer: SubscriberWriter,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of directive subscribers
const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
///
/// Manages the lifecycle of a client connection including:
/// - Protocol handshake
/// - Request processing loop
/// - Directive subscription (for browser integrations)
/// - Graceful shutdown
pub struct ConnectionHandler {
    /// Buffered reader for incoming requests
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing replies (shared for directive broadcast)
    writer: SubscriberWriter,

    /// Handle to the engine actor
    engine: EngineHandle,

    /// Shared subscribers map for directive broadcasting
    subscribers: SubscribersMap,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Counter for generating client IDs
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `reader` - Read half of the Unix stream
    /// * `writer` - Write half of the Unix stream
    /// * `engine` - Handle to the engine actor
    /// * `subscribers` - Shared map of directive subscribers
    /// * `connection_number` - Unique number for this connection
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        engine: EngineHandle,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            engine,
            subscribers,
            client_id: None,
            connection_number,
        }
    }

    /// Drives the connection to completion: handshake, then the request
    /// loop until the client goes away. Returns the client id so the
    /// server can evict a dead subscriber.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(connection = self.connection_number, error = %e, "Handshake failed");
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        let client_id = self.client_id.clone();
        if let Err(e) = self.process_requests().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// First message must be `connect` with a compatible version; the
    /// reply is `connected` (with an assigned id) or `rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let request = self.read_request().await?;

        let client_version = request.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Rejecting incompatible client"
            );
            let reason = format!(
                "Protocol version {client_version} not compatible with server version {}",
                ProtocolVersion::CURRENT
            );
            self.send_reply(DaemonReply::rejected(&reason)).await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        let client_id = match request.action {
            Action::Connect { client_id } => client_id,
            other => {
                self.send_reply(DaemonReply::error("Expected connect action for handshake"))
                    .await?;
                return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")));
            }
        };

        // Clients without an id of their own get one from the counter
        let assigned_id =
            client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
        self.client_id = Some(assigned_id.clone());
        self.send_reply(DaemonReply::connected(assigned_id)).await
    }

    /// Main request processing loop.
    ///
    /// Reads and processes requests until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_requests(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Read with timeout for idle connections
            let request = match timeout(READ_TIMEOUT, self.read_request()).await {
                Ok(Ok(request)) => request,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // Malformed request: answer with an error, keep the
                    // connection so one bad line doesn't kill a client
                    self.send_reply(DaemonReply::error_with_code(&e, ErrorCode::MissingField))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            // Process the request
            if let Err(e) = self.handle_action(request.action).await {
                if matches!(e, ConnectionError::Eof) {
                    return Ok(());
                }
                error!(
                    client_id = ?self.client_id,
                    error = %e,
                    "Error handling request"
                );

                // Send error response but continue processing
                let _ = self.send_reply(DaemonReply::error(&e.to_string())).await;
            }
        }
    }

    /// Handles a single client action.
    async fn handle_action(&mut self, action: Action) -> Result<(), ConnectionError> {
        match action {
            Action::Connect { .. } => {
                // Already connected - send error
                self.send_reply(DaemonReply::error("Already connected")).await?;
            }

            Action::BrowserEvent { event } => {
                let reply = match self.engine.event(event).await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::RequestExtension {
                domain,
                duration,
                reason,
            } => {
                let reply = match self.engine.request_extension(domain, duration, reason).await {
                    Ok((extension, remaining_extensions)) => DaemonReply::ExtensionGranted {
                        extension,
                        remaining_extensions,
                    },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::CheckBlockStatus { domain } => {
                let reply = match self.engine.check_block_status(domain).await {
                    Ok((decision, record)) => DaemonReply::BlockStatus { decision, record },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::GetDomainInfo { domain } => {
                let reply = match self.engine.domain_info(domain).await {
                    Ok(info) => DaemonReply::DomainInfo {
                        domain: info.domain,
                        record: info.record,
                        extensions: info.extensions,
                        active_extension: info.active_extension,
                        remaining_extensions: info.remaining_extensions,
                    },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::GetAllDomains => {
                let reply = match self.engine.all_domains().await {
                    Ok(domains) => DaemonReply::DomainList { domains },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::AddDomain {
                domain,
                daily_limit,
                weekly_limit,
            } => {
                let normalized = timegate_core::Domain::new(&domain);
                let reply = match self
                    .engine
                    .add_domain(domain, daily_limit, weekly_limit)
                    .await
                {
                    Ok(record) => DaemonReply::DomainRecord {
                        domain: normalized.as_str().to_string(),
                        record,
                    },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::UpdateDomain { domain, updates } => {
                let normalized = timegate_core::Domain::new(&domain);
                let reply = match self.engine.update_domain(domain, updates).await {
                    Ok(record) => DaemonReply::DomainRecord {
                        domain: normalized.as_str().to_string(),
                        record,
                    },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::DeleteDomain { domain } => {
                let reply = match self.engine.delete_domain(domain).await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::GetSettings => {
                let reply = match self.engine.settings().await {
                    Ok(settings) => DaemonReply::Settings { settings },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::UpdateSettings { settings } => {
                let reply = match self.engine.update_settings(settings).await {
                    Ok(settings) => DaemonReply::Settings { settings },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::GetExcludedDomains => {
                let reply = match self.engine.excluded_domains().await {
                    Ok(domains) => DaemonReply::ExcludedDomains { domains },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::AddExcludedDomain { domain } => {
                let reply = match self.engine.add_excluded_domain(domain).await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::RemoveExcludedDomain { domain } => {
                let reply = match self.engine.remove_excluded_domain(domain).await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::ExportData => {
                let reply = match self.engine.export_data().await {
                    Ok(data) => DaemonReply::ExportedData { data },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::ImportData { data } => {
                let reply = match self.engine.import_data(data).await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::ResetData => {
                let reply = match self.engine.reset_data().await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::ManualWeeklyReset => {
                let reply = match self.engine.manual_weekly_reset().await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::PauseTracking => {
                let reply = match self.engine.pause_tracking().await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::ResumeTracking => {
                let reply = match self.engine.resume_tracking().await {
                    Ok(()) => DaemonReply::Ok,
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::GetCurrentSession => {
                let reply = match self.engine.current_session().await {
                    Ok(session) => DaemonReply::CurrentSession { session },
                    Err(e) => engine_error_reply(&e),
                };
                self.send_reply(reply).await?;
            }

            Action::Subscribe => {
                let Some(client_id) = self.client_id.clone() else {
                    self.send_reply(DaemonReply::error("Must connect before subscribing"))
                        .await?;
                    return Ok(());
                };

                {
                    let mut subs = self.subscribers.write().await;
                    // Re-subscribing is free; only new entries count
                    // against the cap
                    if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                        drop(subs);
                        self.send_reply(DaemonReply::error(&format!(
                            "Too many subscribers (max: {MAX_SUBSCRIBERS})"
                        )))
                        .await?;
                        return Ok(());
                    }
                    subs.insert(
                        client_id.clone(),
                        Subscriber {
                            writer: Arc::clone(&self.writer),
                        },
                    );
                }

                debug!(client_id = %client_id, "Client subscribed to directives");
                self.send_reply(DaemonReply::Subscribed).await?;
            }

            Action::Ping { seq } => {
                self.send_reply(DaemonReply::pong(seq)).await?;
            }

            Action::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Reads one line and parses it as a request.
    async fn read_request(&mut self) -> Result<ClientRequest, ConnectionError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if n == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
    }

    /// Writes one reply line, holding the shared writer lock so pushed
    /// directives and replies never interleave mid-line.
    async fn send_reply(&self, reply: DaemonReply) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(&reply)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Maps an engine error to a structured error reply.
fn engine_error_reply(error: &EngineError) -> DaemonReply {
    let code = match error {
        EngineError::InvalidDomain(_) => ErrorCode::InvalidDomain,
        EngineError::DomainExists(_) => ErrorCode::DomainExists,
        EngineError::UnknownDomain(_) => ErrorCode::UnknownDomain,
        EngineError::WeeklyExtensionLimit => ErrorCode::WeeklyLimitReached,
        EngineError::ActiveExtensionExists => ErrorCode::ActiveExtensionExists,
        EngineError::Storage(_) => ErrorCode::Storage,
        EngineError::ChannelClosed => ErrorCode::Internal,
    };
    DaemonReply::error_with_code(&error.to_string(), code)
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

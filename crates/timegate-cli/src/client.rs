//! One-shot daemon connection for CLI commands.
//!
//! Each invocation opens the Unix socket, performs the protocol
//! handshake, sends a single action, and reads the reply. The `watch`
//! command keeps the connection open and streams pushed directives.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free
//! guidelines. No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`,
//! or `todo!()`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use timegate_protocol::{Action, ClientRequest, DaemonReply, ProtocolVersion};

/// Default socket path, kept in sync with the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/timegated.sock";

/// Connected and handshaken client.
#[derive(Debug)]
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connects to the daemon and performs the handshake.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        if !socket_path.exists() {
            bail!(
                "Daemon socket not found at {}. Is timegated running?",
                socket_path.display()
            );
        }

        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };

        client.send(ClientRequest::connect(None)).await?;
        match client.recv().await? {
            DaemonReply::Connected {
                protocol_version, ..
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    bail!(
                        "Protocol version mismatch: client {}, daemon {}",
                        ProtocolVersion::CURRENT,
                        protocol_version
                    );
                }
            }
            DaemonReply::Rejected { reason, .. } => {
                bail!("Daemon rejected connection: {reason}");
            }
            other => bail!("Unexpected handshake reply: {other:?}"),
        }

        Ok(client)
    }

    /// Sends one action and returns the daemon's reply.
    pub async fn request(&mut self, action: Action) -> Result<DaemonReply> {
        self.send(ClientRequest::new(action)).await?;
        self.recv().await
    }

    /// Subscribes to directives and yields each pushed reply to the
    /// callback until the connection closes or the callback errors.
    pub async fn watch<F>(mut self, mut on_reply: F) -> Result<()>
    where
        F: FnMut(DaemonReply) -> Result<()>,
    {
        match self.request(Action::Subscribe).await? {
            DaemonReply::Subscribed => {}
            other => bail!("Unexpected subscribe reply: {other:?}"),
        }

        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .context("Failed to read from daemon")?;
            if n == 0 {
                // Daemon closed the connection
                return Ok(());
            }
            let reply: DaemonReply =
                serde_json::from_str(line.trim()).context("Malformed reply from daemon")?;
            on_reply(reply)?;
        }
    }

    async fn send(&mut self, request: ClientRequest) -> Result<()> {
        let json = serde_json::to_string(&request).context("Failed to serialize request")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write to daemon")?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonReply> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read from daemon")?;
        if n == 0 {
            bail!("Daemon closed the connection");
        }
        serde_json::from_str(line.trim()).context("Malformed reply from daemon")
    }
}

/// Resolves the socket path: CLI flag, then environment, then default.
pub fn resolve_socket_path(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| {
        std::env::var("TIMEGATE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH))
    })
}

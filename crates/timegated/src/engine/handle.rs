//! Cloneable handle for communicating with the engine actor.

use std::collections::BTreeMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use timegate_core::{ActiveExtension, ActiveSession, Decision, DomainRecord, Millis, Settings};
use timegate_protocol::{BrowserEvent, Directive, DomainUpdates, SettingsUpdate};

use crate::storage::Storage;
use crate::store::StoreError;

use super::actor::EngineActor;
use super::commands::{DomainInfo, EngineCommand, EngineError};

/// Command channel capacity.
const COMMAND_BUFFER: usize = 64;

/// Directive broadcast capacity. Slow subscribers that lag past this
/// many directives miss the oldest ones.
const DIRECTIVE_BUFFER: usize = 256;

/// Handle for sending commands to the engine actor.
///
/// Cheap to clone; all clones talk to the same actor. The server hands
/// one to every connection.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    directives: broadcast::Sender<Directive>,
}

/// Spawns the engine actor and returns a handle plus the actor's task.
///
/// Startup work (default settings, pending weekly reset, stale session
/// cleanup) happens before the actor starts accepting commands, so the
/// first client already sees consistent state.
pub async fn spawn_engine(storage: Storage) -> Result<(EngineHandle, JoinHandle<()>), StoreError> {
    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
    let (directives, _) = broadcast::channel(DIRECTIVE_BUFFER);

    let mut actor = EngineActor::new(receiver, sender.clone(), storage, directives.clone());
    actor.initialize().await?;

    let join = tokio::spawn(actor.run());
    Ok((EngineHandle { sender, directives }, join))
}

impl EngineHandle {
    /// Subscribes to enforcement directives (overlays, notifications).
    pub fn subscribe(&self) -> broadcast::Receiver<Directive> {
        self.directives.subscribe()
    }

    /// Returns true if the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send<T>(
        &self,
        cmd: EngineCommand,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Forwards a browser event to the session tracker.
    pub async fn event(&self, event: BrowserEvent) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::Event {
                event,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Requests a blocking extension; returns the grant and the
    /// remaining weekly quota.
    pub async fn request_extension(
        &self,
        domain: String,
        duration: Option<Millis>,
        reason: Option<String>,
    ) -> Result<(ActiveExtension, u32), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::RequestExtension {
                domain,
                duration,
                reason,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn check_block_status(
        &self,
        domain: String,
    ) -> Result<(Decision, Option<DomainRecord>), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::CheckBlockStatus {
                domain,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn domain_info(&self, domain: String) -> Result<DomainInfo, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::GetDomainInfo {
                domain,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn all_domains(&self) -> Result<BTreeMap<String, DomainRecord>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetAllDomains { respond_to: tx }, rx).await
    }

    pub async fn add_domain(
        &self,
        domain: String,
        daily_limit: Option<Millis>,
        weekly_limit: Option<Millis>,
    ) -> Result<DomainRecord, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::AddDomain {
                domain,
                daily_limit,
                weekly_limit,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn update_domain(
        &self,
        domain: String,
        updates: DomainUpdates,
    ) -> Result<DomainRecord, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::UpdateDomain {
                domain,
                updates,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn delete_domain(&self, domain: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::DeleteDomain {
                domain,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn settings(&self) -> Result<Settings, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetSettings { respond_to: tx }, rx).await
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<Settings, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::UpdateSettings {
                update,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn excluded_domains(&self) -> Result<Vec<String>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetExcludedDomains { respond_to: tx }, rx).await
    }

    pub async fn add_excluded_domain(&self, domain: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::AddExcludedDomain {
                domain,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn remove_excluded_domain(&self, domain: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::RemoveExcludedDomain {
                domain,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn export_data(&self) -> Result<serde_json::Value, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ExportData { respond_to: tx }, rx).await
    }

    pub async fn import_data(&self, data: serde_json::Value) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            EngineCommand::ImportData {
                data,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub async fn reset_data(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ResetData { respond_to: tx }, rx).await
    }

    pub async fn manual_weekly_reset(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ManualWeeklyReset { respond_to: tx }, rx).await
    }

    pub async fn pause_tracking(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::PauseTracking { respond_to: tx }, rx).await
    }

    pub async fn resume_tracking(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ResumeTracking { respond_to: tx }, rx).await
    }

    pub async fn current_session(&self) -> Result<Option<ActiveSession>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::GetCurrentSession { respond_to: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Fire-and-forget sweep trigger, used by the maintenance task.
    pub async fn sweep_expired_extensions(&self) -> Result<(), EngineError> {
        self.sender
            .send(EngineCommand::SweepExpiredExtensions)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Flushes the running session and stops the actor.
    ///
    /// Resolves once the final flush has landed in storage.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;
    use timegate_core::HOUR_MS;

    async fn spawn_test_engine() -> (EngineHandle, JoinHandle<()>) {
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        spawn_engine(storage).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_through_running_actor() {
        let (handle, _join) = spawn_test_engine().await;

        let record = handle
            .add_domain("example.com".to_string(), Some(HOUR_MS), None)
            .await
            .unwrap();
        assert_eq!(record.daily_limit, Some(HOUR_MS));

        let domains = handle.all_domains().await.unwrap();
        assert!(domains.contains_key("example.com"));

        handle.delete_domain("example.com".to_string()).await.unwrap();
        let domains = handle.all_domains().await.unwrap();
        assert!(domains.is_empty());
    }

    #[tokio::test]
    async fn test_handle_reports_disconnect_after_actor_exit() {
        let (handle, join) = spawn_test_engine().await;
        assert!(handle.is_connected());

        handle.shutdown().await.unwrap();
        let _ = join.await;

        let result = handle.current_session().await;
        assert!(matches!(result, Err(EngineError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_subscribe_receives_directives() {
        let (handle, _join) = spawn_test_engine().await;
        let mut rx = handle.subscribe();

        handle
            .add_domain("example.com".to_string(), None, Some(HOUR_MS))
            .await
            .unwrap();
        // An extension grant publishes a notification directive
        handle
            .request_extension("example.com".to_string(), Some(1), None)
            .await
            .unwrap();

        let directive = rx.recv().await.unwrap();
        assert!(matches!(directive, Directive::Notify { .. }));
    }
}

//! Engine actor - owns the active session, the tab map, and storage.
//!
//! The EngineActor is the single owner of tracking state in the system.
//! It receives commands via an mpsc channel and publishes enforcement
//! directives via broadcast. Exactly one session exists at any instant;
//! switching domains is modeled as stop-then-start.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use timegate_core::{
    today_start, ActiveExtension, ActiveSession, Decision, Domain, DomainRecord, Millis, Settings,
    TabId,
};
use timegate_protocol::{BrowserEvent, Directive, DomainUpdates, IdleState, SettingsUpdate};

use crate::storage::Storage;
use crate::store::StoreError;

use super::commands::{DomainInfo, EngineCommand, EngineError};

// ============================================================================
// Timer Intervals
// ============================================================================

/// How often a running session flushes elapsed time to storage.
/// Bounds data loss on crash to one interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// How often the session heartbeat persists the session snapshot.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

// ============================================================================
// Engine Actor
// ============================================================================

/// The engine actor - owns all tracking and enforcement state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes directives to subscribers.
///
/// # Ownership
///
/// The actor owns:
/// - `session`: the single active tracking session, if any
/// - `tabs`: current domain per open tab, built from browser events
/// - `storage`: the typed persistence layer
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially.
/// All state mutations happen within this single task, so read-modify-
/// write sequences on domain records never interleave.
pub struct EngineActor {
    /// Command receiver
    receiver: mpsc::Receiver<EngineCommand>,

    /// Sender clone handed to per-session timer tasks
    timer_tx: mpsc::Sender<EngineCommand>,

    /// Typed persistence layer
    pub(super) storage: Storage,

    /// Directive publisher for subscribed browser integrations
    pub(super) directives: broadcast::Sender<Directive>,

    /// The single active tracking session
    session: Option<ActiveSession>,

    /// Current domain per open tab; tabs on untrackable URLs are absent
    pub(super) tabs: HashMap<TabId, Domain>,

    /// The tab currently in the foreground, if known
    active_tab: Option<TabId>,

    /// Whether any browser window has focus
    window_focused: bool,

    /// Cancels the flush and keep-alive timers of the current session.
    /// A session never has two live flush timers: starting a new session
    /// cancels this token before spawning fresh tasks.
    session_timers: Option<CancellationToken>,
}

/// Current time in epoch milliseconds.
pub(super) fn now_ms() -> Millis {
    Utc::now().timestamp_millis()
}

impl EngineActor {
    /// Creates a new engine actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `timer_tx` - Sender clone for timer tasks to push ticks through
    /// * `storage` - The typed persistence layer
    /// * `directives` - Broadcast channel for publishing directives
    pub fn new(
        receiver: mpsc::Receiver<EngineCommand>,
        timer_tx: mpsc::Sender<EngineCommand>,
        storage: Storage,
        directives: broadcast::Sender<Directive>,
    ) -> Self {
        Self {
            receiver,
            timer_tx,
            storage,
            directives,
            session: None,
            tabs: HashMap::new(),
            active_tab: None,
            window_focused: true,
            session_timers: None,
        }
    }

    /// Performs startup work: ensures defaults exist, applies a pending
    /// weekly reset, and discards any session left over from a previous
    /// run. Elapsed real time while the daemon was down is unknowable
    /// and must not be attributed.
    pub async fn initialize(&mut self) -> Result<(), StoreError> {
        self.storage.initialize().await?;
        self.storage.check_and_reset_week().await?;

        if let Some(stale) = self.storage.active_session().await? {
            info!(
                domain = %stale.domain,
                tab_id = stale.tab_id,
                "Discarding stale session from previous run"
            );
            self.storage.save_active_session(None).await?;
        }

        Ok(())
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// This is the main entry point - call this in a spawned task.
    pub async fn run(mut self) {
        info!("Engine actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if let EngineCommand::Shutdown { respond_to } = cmd {
                // Flush whatever the current session accumulated
                if let Err(e) = self.stop_tracking().await {
                    warn!(error = %e, "Failed to flush session on shutdown");
                }
                let _ = respond_to.send(());
                break;
            }
            self.handle_command(cmd).await;
        }

        info!("Engine actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Event { event, respond_to } => {
                let result = self.handle_event(event).await;
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            EngineCommand::RequestExtension {
                domain,
                duration,
                reason,
                respond_to,
            } => {
                let result = self.handle_request_extension(&domain, duration, reason).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::CheckBlockStatus { domain, respond_to } => {
                let result = self.handle_check_block_status(&domain).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::GetDomainInfo { domain, respond_to } => {
                let result = self.handle_get_domain_info(&domain).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::GetAllDomains { respond_to } => {
                let result = self.storage.domains().await.map_err(EngineError::from);
                let _ = respond_to.send(result);
            }
            EngineCommand::AddDomain {
                domain,
                daily_limit,
                weekly_limit,
                respond_to,
            } => {
                let result = self.handle_add_domain(&domain, daily_limit, weekly_limit).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::UpdateDomain {
                domain,
                updates,
                respond_to,
            } => {
                let result = self.handle_update_domain(&domain, updates).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::DeleteDomain { domain, respond_to } => {
                let result = self.handle_delete_domain(&domain).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::GetSettings { respond_to } => {
                let result = self.storage.settings().await.map_err(EngineError::from);
                let _ = respond_to.send(result);
            }
            EngineCommand::UpdateSettings { update, respond_to } => {
                let result = self.handle_update_settings(update).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::GetExcludedDomains { respond_to } => {
                let result = self.storage.excluded_domains().await.map_err(EngineError::from);
                let _ = respond_to.send(result);
            }
            EngineCommand::AddExcludedDomain { domain, respond_to } => {
                let result = self.handle_add_excluded_domain(&domain).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::RemoveExcludedDomain { domain, respond_to } => {
                let result = self.handle_remove_excluded_domain(&domain).await;
                let _ = respond_to.send(result);
            }
            EngineCommand::ExportData { respond_to } => {
                let result = self.storage.export().await.map_err(EngineError::from);
                let _ = respond_to.send(result);
            }
            EngineCommand::ImportData { data, respond_to } => {
                let result = self
                    .storage
                    .import(&data)
                    .await
                    .map(|_| ())
                    .map_err(EngineError::from);
                let _ = respond_to.send(result);
            }
            EngineCommand::ResetData { respond_to } => {
                let result = self.handle_reset_data().await;
                let _ = respond_to.send(result);
            }
            EngineCommand::ManualWeeklyReset { respond_to } => {
                let result = self.handle_manual_weekly_reset().await;
                let _ = respond_to.send(result);
            }
            EngineCommand::PauseTracking { respond_to } => {
                let result = self.handle_pause_tracking().await;
                let _ = respond_to.send(result);
            }
            EngineCommand::ResumeTracking { respond_to } => {
                let result = self.handle_resume_tracking().await;
                let _ = respond_to.send(result);
            }
            EngineCommand::GetCurrentSession { respond_to } => {
                let _ = respond_to.send(self.session.clone());
            }
            EngineCommand::FlushTick => {
                if let Err(e) = self.handle_flush_tick().await {
                    warn!(error = %e, "Flush tick failed, will retry next tick");
                }
            }
            EngineCommand::KeepAliveTick => {
                if let Err(e) = self.handle_keep_alive_tick().await {
                    warn!(error = %e, "Keep-alive tick failed");
                }
            }
            EngineCommand::SweepExpiredExtensions => {
                if let Err(e) = self.sweep_expired_extensions().await {
                    warn!(error = %e, "Extension sweep failed, will retry next tick");
                }
            }
            // run() intercepts shutdown before dispatch; acknowledge anyway
            EngineCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Browser Events
    // ========================================================================

    /// Applies a browser event to the tab map and the session tracker.
    async fn handle_event(&mut self, event: BrowserEvent) -> Result<(), EngineError> {
        match event {
            BrowserEvent::TabActivated { tab_id, url } => {
                if let Some(url) = url {
                    match Domain::from_url(&url) {
                        Some(domain) => {
                            self.tabs.insert(tab_id, domain);
                        }
                        None => {
                            self.tabs.remove(&tab_id);
                        }
                    }
                }
                self.active_tab = Some(tab_id);
                self.track_active_tab().await
            }

            BrowserEvent::TabUpdated { tab_id, url, active } => {
                match Domain::from_url(&url) {
                    Some(domain) => {
                        self.tabs.insert(tab_id, domain);
                    }
                    None => {
                        self.tabs.remove(&tab_id);
                    }
                }
                if active {
                    self.active_tab = Some(tab_id);
                    self.track_active_tab().await
                } else {
                    Ok(())
                }
            }

            BrowserEvent::TabRemoved { tab_id } => {
                self.tabs.remove(&tab_id);
                if self.active_tab == Some(tab_id) {
                    self.active_tab = None;
                }
                if self.session.as_ref().map(|s| s.tab_id) == Some(tab_id) {
                    self.stop_tracking().await
                } else {
                    Ok(())
                }
            }

            BrowserEvent::WindowFocusChanged { focused } => {
                self.window_focused = focused;
                if focused {
                    self.track_active_tab().await
                } else {
                    self.stop_tracking().await
                }
            }

            BrowserEvent::IdleStateChanged { state } => match state {
                IdleState::Active => self.track_active_tab().await,
                IdleState::Idle | IdleState::Locked => self.stop_tracking().await,
            },
        }
    }

    /// Re-evaluates tracking against the current foreground tab.
    async fn track_active_tab(&mut self) -> Result<(), EngineError> {
        if !self.window_focused {
            return Ok(());
        }

        let target = self
            .active_tab
            .and_then(|tab_id| self.tabs.get(&tab_id).cloned().map(|d| (tab_id, d)));

        match target {
            Some((tab_id, domain)) => self.start_tracking(tab_id, domain).await,
            // Foreground tab has no trackable domain
            None => self.stop_tracking().await,
        }
    }

    // ========================================================================
    // Session Tracker
    // ========================================================================

    /// Starts tracking a domain in a tab.
    ///
    /// Any existing session for a different domain or tab is stopped and
    /// flushed first; only then are the enabled and excluded checks
    /// applied, so a switch away from a tracked domain always lands its
    /// time even when the new target is untracked.
    async fn start_tracking(&mut self, tab_id: TabId, domain: Domain) -> Result<(), EngineError> {
        if let Some(session) = &self.session {
            if session.domain == domain && session.tab_id == tab_id {
                return Ok(());
            }
        }

        self.stop_tracking().await?;

        let settings = self.storage.settings().await?;
        if !settings.tracking_enabled {
            return Ok(());
        }

        let excluded = self.storage.excluded_domains().await?;
        if excluded.iter().any(|d| d == domain.as_str()) {
            debug!(domain = %domain, "Domain is excluded, not tracking");
            return Ok(());
        }

        let session = ActiveSession::start(domain.clone(), tab_id, now_ms());
        self.storage.save_active_session(Some(&session)).await?;
        self.session = Some(session);
        self.spawn_session_timers();

        info!(domain = %domain, tab_id, "Started tracking");
        Ok(())
    }

    /// Stops the current session, flushing its elapsed time.
    ///
    /// No-op if no session is active. Always cancels the session timers.
    async fn stop_tracking(&mut self) -> Result<(), EngineError> {
        self.cancel_session_timers();

        let mut session = match self.session.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        let now = now_ms();
        let elapsed = session.rebase(now);
        if elapsed > 0 {
            self.storage
                .add_domain_time(session.domain.as_str(), elapsed, now, today_start())
                .await?;
            self.check_and_enforce(session.domain.as_str()).await?;
        }

        self.storage.save_active_session(None).await?;
        info!(domain = %session.domain, flushed_ms = elapsed, "Stopped tracking");
        Ok(())
    }

    /// Periodic flush: lands elapsed time and rebases the session so the
    /// next flush never double counts.
    ///
    /// The rebase happens only after the storage write succeeds; a failed
    /// write leaves the session untouched so the next tick flushes the
    /// same time again.
    async fn handle_flush_tick(&mut self) -> Result<(), EngineError> {
        let (domain, elapsed, now) = {
            let session = match &self.session {
                Some(s) if !s.paused => s,
                _ => return Ok(()),
            };
            let now = now_ms();
            (session.domain.clone(), session.elapsed(now), now)
        };

        if elapsed > 0 {
            self.storage
                .add_domain_time(domain.as_str(), elapsed, now, today_start())
                .await?;
            if let Some(session) = &mut self.session {
                session.rebase(now);
            }
            self.check_and_enforce(domain.as_str()).await?;
        }

        if let Some(session) = &self.session {
            self.storage.save_active_session(Some(session)).await?;
        }
        Ok(())
    }

    /// Session heartbeat: persists the current session snapshot.
    async fn handle_keep_alive_tick(&mut self) -> Result<(), EngineError> {
        if let Some(session) = &self.session {
            self.storage.save_active_session(Some(session)).await?;
            debug!(domain = %session.domain, "Session heartbeat");
        }
        Ok(())
    }

    /// Freezes accounting by folding elapsed time into the session's
    /// accumulator. The session survives; periodic flushes no-op until
    /// resume.
    async fn handle_pause_tracking(&mut self) -> Result<(), EngineError> {
        if let Some(session) = &mut self.session {
            session.pause(now_ms());
            let snapshot = session.clone();
            self.storage.save_active_session(Some(&snapshot)).await?;
            info!(domain = %snapshot.domain, "Tracking paused");
        }
        Ok(())
    }

    async fn handle_resume_tracking(&mut self) -> Result<(), EngineError> {
        if let Some(session) = &mut self.session {
            session.resume(now_ms());
            let snapshot = session.clone();
            self.storage.save_active_session(Some(&snapshot)).await?;
            info!(domain = %snapshot.domain, "Tracking resumed");
        }
        Ok(())
    }

    /// Spawns the flush and keep-alive timers for the current session,
    /// cancelling any timers from a prior session first.
    fn spawn_session_timers(&mut self) {
        self.cancel_session_timers();

        let token = CancellationToken::new();
        self.session_timers = Some(token.clone());

        let flush_tx = self.timer_tx.clone();
        let flush_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            // First tick fires immediately; skip it so a fresh session
            // isn't flushed at zero elapsed
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = flush_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if flush_tx.send(EngineCommand::FlushTick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let keep_alive_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if keep_alive_tx.send(EngineCommand::KeepAliveTick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn cancel_session_timers(&mut self) {
        if let Some(token) = self.session_timers.take() {
            token.cancel();
        }
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    /// Grants a blocking extension for a domain.
    ///
    /// Rejection order: weekly quota first, then an existing unexpired
    /// extension. On success the domain is unblocked immediately rather
    /// than waiting for the next evaluation.
    async fn handle_request_extension(
        &mut self,
        domain: &str,
        duration: Option<Millis>,
        reason: Option<String>,
    ) -> Result<(ActiveExtension, u32), EngineError> {
        let domain = Domain::new(domain);
        let settings = self.storage.settings().await?;
        let now = now_ms();

        let mut extensions = self.storage.extensions().await?;
        let record = extensions.entry(domain.as_str().to_string()).or_default();

        if record.weekly_requests.len() as u32 >= settings.max_weekly_extensions {
            return Err(EngineError::WeeklyExtensionLimit);
        }

        if record.active_extension(now).is_some() {
            return Err(EngineError::ActiveExtensionExists);
        }

        let duration = duration.unwrap_or(settings.default_extension_duration);
        let reason = reason.unwrap_or_default();
        let extension = record.record_request(duration, reason, now, today_start());
        let used = record.weekly_requests.len() as u32;
        self.storage.save_extensions(&extensions).await?;

        // Unblock immediately so no stale block window remains
        self.unblock_if_blocked(domain.as_str()).await?;

        let remaining = settings.max_weekly_extensions.saturating_sub(used);
        info!(
            domain = %domain,
            duration_ms = duration,
            remaining,
            "Extension granted"
        );

        self.notify(
            &settings,
            &format!("extension-{}", domain.as_str()),
            "Extension granted",
            &format!(
                "{} is unblocked for {}",
                domain.as_str(),
                timegate_core::format_duration(duration, false)
            ),
        );

        Ok((extension, remaining))
    }

    // ========================================================================
    // Domain CRUD
    // ========================================================================

    async fn handle_check_block_status(
        &mut self,
        domain: &str,
    ) -> Result<(Decision, Option<DomainRecord>), EngineError> {
        let domain = Domain::new(domain);
        let record = match self.storage.domain(domain.as_str()).await? {
            Some(r) => r,
            None => return Ok((Decision::Unlimited, None)),
        };

        let has_extension = self.clear_expired_extension(domain.as_str()).await?;
        let decision = timegate_core::evaluate(&record, has_extension);
        Ok((decision, Some(record)))
    }

    async fn handle_get_domain_info(&mut self, domain: &str) -> Result<DomainInfo, EngineError> {
        let domain = Domain::new(domain);
        let record = self
            .storage
            .domain(domain.as_str())
            .await?
            .ok_or_else(|| EngineError::UnknownDomain(domain.as_str().to_string()))?;

        let extensions = self.storage.extension_record(domain.as_str()).await?;
        let settings = self.storage.settings().await?;
        let active_extension = extensions.active_extension(now_ms()).cloned();
        let remaining_extensions = settings
            .max_weekly_extensions
            .saturating_sub(extensions.weekly_requests.len() as u32);

        Ok(DomainInfo {
            domain: domain.as_str().to_string(),
            record,
            extensions,
            active_extension,
            remaining_extensions,
        })
    }

    async fn handle_add_domain(
        &mut self,
        domain: &str,
        daily_limit: Option<Millis>,
        weekly_limit: Option<Millis>,
    ) -> Result<DomainRecord, EngineError> {
        let domain = Domain::validated(domain)
            .map_err(|_| EngineError::InvalidDomain(domain.to_string()))?;

        let mut domains = self.storage.domains().await?;
        if domains.contains_key(domain.as_str()) {
            return Err(EngineError::DomainExists(domain.as_str().to_string()));
        }

        let record = DomainRecord::with_limits(daily_limit, weekly_limit, now_ms());
        domains.insert(domain.as_str().to_string(), record.clone());
        self.storage.save_domains(&domains).await?;

        info!(
            domain = %domain,
            daily_limit = ?daily_limit,
            weekly_limit = ?weekly_limit,
            "Domain added"
        );
        Ok(record)
    }

    async fn handle_update_domain(
        &mut self,
        domain: &str,
        updates: DomainUpdates,
    ) -> Result<DomainRecord, EngineError> {
        let domain = Domain::new(domain);

        let mut domains = self.storage.domains().await?;
        let record = domains
            .get_mut(domain.as_str())
            .ok_or_else(|| EngineError::UnknownDomain(domain.as_str().to_string()))?;

        if let Some(daily_limit) = updates.daily_limit {
            record.daily_limit = daily_limit;
        }
        if let Some(weekly_limit) = updates.weekly_limit {
            record.weekly_limit = weekly_limit;
        }
        record.last_updated = now_ms();

        let updated = record.clone();
        self.storage.save_domains(&domains).await?;

        // New limits may block or unblock immediately
        self.check_and_enforce(domain.as_str()).await?;

        // Enforcement may have flipped the block flag; return fresh state
        Ok(self.storage.domain(domain.as_str()).await?.unwrap_or(updated))
    }

    async fn handle_delete_domain(&mut self, domain: &str) -> Result<(), EngineError> {
        let domain = Domain::new(domain);

        let mut domains = self.storage.domains().await?;
        if domains.remove(domain.as_str()).is_none() {
            return Err(EngineError::UnknownDomain(domain.as_str().to_string()));
        }
        self.storage.save_domains(&domains).await?;

        let mut extensions = self.storage.extensions().await?;
        if extensions.remove(domain.as_str()).is_some() {
            self.storage.save_extensions(&extensions).await?;
        }

        info!(domain = %domain, "Domain deleted");
        Ok(())
    }

    // ========================================================================
    // Settings and Exclusions
    // ========================================================================

    async fn handle_update_settings(
        &mut self,
        update: SettingsUpdate,
    ) -> Result<Settings, EngineError> {
        let mut settings = self.storage.settings().await?;

        if let Some(v) = update.tracking_enabled {
            settings.tracking_enabled = v;
        }
        if let Some(v) = update.notifications_enabled {
            settings.notifications_enabled = v;
        }
        if let Some(v) = update.max_weekly_extensions {
            settings.max_weekly_extensions = v;
        }
        if let Some(v) = update.max_daily_extensions {
            settings.max_daily_extensions = v;
        }
        if let Some(v) = update.default_extension_duration {
            settings.default_extension_duration = v;
        }
        if let Some(v) = update.week_start_day {
            settings.week_start_day = v.min(6);
        }
        if let Some(v) = update.idle_threshold_seconds {
            settings.idle_threshold_seconds = v;
        }

        self.storage.save_settings(&settings).await?;
        info!("Settings updated");

        if !settings.tracking_enabled {
            self.stop_tracking().await?;
        }

        Ok(settings)
    }

    async fn handle_add_excluded_domain(&mut self, domain: &str) -> Result<(), EngineError> {
        let domain = Domain::validated(domain)
            .map_err(|_| EngineError::InvalidDomain(domain.to_string()))?;

        let mut excluded = self.storage.excluded_domains().await?;
        if !excluded.iter().any(|d| d == domain.as_str()) {
            excluded.push(domain.as_str().to_string());
            excluded.sort();
            self.storage.save_excluded_domains(&excluded).await?;
        }

        if self.session.as_ref().map(|s| &s.domain) == Some(&domain) {
            self.stop_tracking().await?;
        }

        info!(domain = %domain, "Domain excluded from tracking");
        Ok(())
    }

    async fn handle_remove_excluded_domain(&mut self, domain: &str) -> Result<(), EngineError> {
        let domain = Domain::new(domain);

        let mut excluded = self.storage.excluded_domains().await?;
        let before = excluded.len();
        excluded.retain(|d| d != domain.as_str());
        if excluded.len() != before {
            self.storage.save_excluded_domains(&excluded).await?;
        }

        // The foreground tab may now be trackable
        self.track_active_tab().await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn handle_reset_data(&mut self) -> Result<(), EngineError> {
        self.cancel_session_timers();
        self.session = None;
        self.storage.reset_all().await?;
        info!("All data reset");
        Ok(())
    }

    async fn handle_manual_weekly_reset(&mut self) -> Result<(), EngineError> {
        let settings = self.storage.settings().await?;
        let marker = timegate_core::current_week_info(settings.week_start_day);
        self.storage.perform_weekly_reset(&marker).await?;
        Ok(())
    }

    // ========================================================================
    // Test Support
    // ========================================================================

    #[cfg(test)]
    pub(super) async fn handle_for_test(&mut self, cmd: EngineCommand) {
        self.handle_command(cmd).await;
    }

    #[cfg(test)]
    pub(super) fn session_for_test(&self) -> Option<&ActiveSession> {
        self.session.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use timegate_core::{LimitKind, HOUR_MS, MINUTE_MS};
    use tokio::sync::oneshot;

    pub(super) fn test_actor() -> (EngineActor, broadcast::Receiver<Directive>) {
        let (tx, rx) = mpsc::channel(64);
        let (directive_tx, directive_rx) = broadcast::channel(64);
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        (
            EngineActor::new(rx, tx, storage, directive_tx),
            directive_rx,
        )
    }

    async fn send_event(actor: &mut EngineActor, event: BrowserEvent) {
        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::Event {
                event,
                respond_to: tx,
            })
            .await;
        let result = rx.await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_tab_activation_starts_session() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://www.example.com/page".to_string()),
            },
        )
        .await;

        let session = actor.session_for_test().unwrap();
        assert_eq!(session.domain.as_str(), "example.com");
        assert_eq!(session.tab_id, 1);

        // Session is persisted
        let stored = actor.storage.active_session().await.unwrap();
        assert_eq!(stored.as_ref().map(|s| s.tab_id), Some(1));
    }

    #[tokio::test]
    async fn test_internal_page_stops_session() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;
        assert!(actor.session_for_test().is_some());

        send_event(
            &mut actor,
            BrowserEvent::TabUpdated {
                tab_id: 1,
                url: "about:blank".to_string(),
                active: true,
            },
        )
        .await;
        assert!(actor.session_for_test().is_none());
    }

    #[tokio::test]
    async fn test_window_blur_stops_focus_resumes() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 2,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;

        send_event(&mut actor, BrowserEvent::WindowFocusChanged { focused: false }).await;
        assert!(actor.session_for_test().is_none());

        send_event(&mut actor, BrowserEvent::WindowFocusChanged { focused: true }).await;
        let session = actor.session_for_test().unwrap();
        assert_eq!(session.domain.as_str(), "example.com");
    }

    #[tokio::test]
    async fn test_idle_stops_active_resumes() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 3,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;

        send_event(
            &mut actor,
            BrowserEvent::IdleStateChanged {
                state: IdleState::Idle,
            },
        )
        .await;
        assert!(actor.session_for_test().is_none());

        send_event(
            &mut actor,
            BrowserEvent::IdleStateChanged {
                state: IdleState::Active,
            },
        )
        .await;
        assert!(actor.session_for_test().is_some());
    }

    #[tokio::test]
    async fn test_tracking_disabled_blocks_new_sessions() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::UpdateSettings {
                update: SettingsUpdate {
                    tracking_enabled: Some(false),
                    ..SettingsUpdate::default()
                },
                respond_to: tx,
            })
            .await;
        assert!(rx.await.unwrap().is_ok());

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;
        assert!(actor.session_for_test().is_none());
    }

    #[tokio::test]
    async fn test_excluded_domain_not_tracked() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddExcludedDomain {
                domain: "example.com".to_string(),
                respond_to: tx,
            })
            .await;
        assert!(rx.await.unwrap().is_ok());

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://www.example.com/".to_string()),
            },
        )
        .await;
        assert!(actor.session_for_test().is_none());
    }

    #[tokio::test]
    async fn test_excluding_tracked_domain_stops_session() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;
        assert!(actor.session_for_test().is_some());

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddExcludedDomain {
                domain: "example.com".to_string(),
                respond_to: tx,
            })
            .await;
        assert!(rx.await.unwrap().is_ok());
        assert!(actor.session_for_test().is_none());
    }

    #[tokio::test]
    async fn test_add_domain_stores_both_limits() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddDomain {
                domain: "Example.com".to_string(),
                daily_limit: Some(HOUR_MS),
                weekly_limit: Some(10 * HOUR_MS),
                respond_to: tx,
            })
            .await;
        let record = rx.await.unwrap().unwrap();
        assert_eq!(record.daily_limit, Some(HOUR_MS));
        assert_eq!(record.weekly_limit, Some(10 * HOUR_MS));

        // Normalized key
        assert!(actor.storage.domain("example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_domain_rejects_duplicates_and_garbage() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddDomain {
                domain: "example.com".to_string(),
                daily_limit: None,
                weekly_limit: None,
                respond_to: tx,
            })
            .await;
        assert!(rx.await.unwrap().is_ok());

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddDomain {
                domain: "example.com".to_string(),
                daily_limit: None,
                weekly_limit: None,
                respond_to: tx,
            })
            .await;
        assert!(matches!(rx.await.unwrap(), Err(EngineError::DomainExists(_))));

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddDomain {
                domain: "not a domain".to_string(),
                daily_limit: None,
                weekly_limit: None,
                respond_to: tx,
            })
            .await;
        assert!(matches!(rx.await.unwrap(), Err(EngineError::InvalidDomain(_))));
    }

    #[tokio::test]
    async fn test_update_domain_clears_limit_with_null() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::AddDomain {
                domain: "example.com".to_string(),
                daily_limit: Some(HOUR_MS),
                weekly_limit: Some(10 * HOUR_MS),
                respond_to: tx,
            })
            .await;
        rx.await.unwrap().unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::UpdateDomain {
                domain: "example.com".to_string(),
                updates: DomainUpdates {
                    daily_limit: Some(None),
                    weekly_limit: None,
                },
                respond_to: tx,
            })
            .await;
        let record = rx.await.unwrap().unwrap();
        assert_eq!(record.daily_limit, None);
        assert_eq!(record.weekly_limit, Some(10 * HOUR_MS));
    }

    #[tokio::test]
    async fn test_extension_grant_and_second_grant_rejected() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::RequestExtension {
                domain: "example.com".to_string(),
                duration: Some(30 * MINUTE_MS),
                reason: Some("deadline".to_string()),
                respond_to: tx,
            })
            .await;
        let (extension, remaining) = rx.await.unwrap().unwrap();
        assert_eq!(extension.duration, 30 * MINUTE_MS);
        assert_eq!(remaining, 2);

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::RequestExtension {
                domain: "example.com".to_string(),
                duration: None,
                reason: None,
                respond_to: tx,
            })
            .await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::ActiveExtensionExists)
        ));
    }

    #[tokio::test]
    async fn test_extension_weekly_quota_enforced() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        // Pre-load a record whose weekly log is already at the quota
        let mut extensions = std::collections::BTreeMap::new();
        let mut record = timegate_core::ExtensionRecord::default();
        for i in 0..3 {
            record.record_request(MINUTE_MS, format!("r{i}"), i, 0);
        }
        // All expired long ago, so only the quota check can reject
        record.current_extension = None;
        extensions.insert("example.com".to_string(), record);
        actor.storage.save_extensions(&extensions).await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::RequestExtension {
                domain: "example.com".to_string(),
                duration: None,
                reason: None,
                respond_to: tx,
            })
            .await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(EngineError::WeeklyExtensionLimit)
        ));
    }

    #[tokio::test]
    async fn test_extension_grant_unblocks_domain() {
        let (mut actor, mut directives) = test_actor();
        actor.initialize().await.unwrap();

        let mut domains = std::collections::BTreeMap::new();
        domains.insert(
            "example.com".to_string(),
            DomainRecord {
                weekly_time: 10 * HOUR_MS,
                weekly_limit: Some(10 * HOUR_MS),
                is_blocked: true,
                ..DomainRecord::default()
            },
        );
        actor.storage.save_domains(&domains).await.unwrap();
        actor.tabs.insert(7, Domain::new("example.com"));

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::RequestExtension {
                domain: "example.com".to_string(),
                duration: Some(30 * MINUTE_MS),
                reason: None,
                respond_to: tx,
            })
            .await;
        rx.await.unwrap().unwrap();

        let record = actor.storage.domain("example.com").await.unwrap().unwrap();
        assert!(!record.is_blocked);

        // Hide directive went out for the open tab
        let mut saw_hide = false;
        while let Ok(directive) = directives.try_recv() {
            if matches!(directive, Directive::HideOverlay { tab_id: 7, .. }) {
                saw_hide = true;
            }
        }
        assert!(saw_hide);
    }

    #[tokio::test]
    async fn test_check_block_status_untracked_is_unlimited() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::CheckBlockStatus {
                domain: "nobody.example".to_string(),
                respond_to: tx,
            })
            .await;
        let (decision, record) = rx.await.unwrap().unwrap();
        assert_eq!(decision, Decision::Unlimited);
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_weekly_breach_blocks_and_notifies_tabs() {
        let (mut actor, mut directives) = test_actor();
        actor.initialize().await.unwrap();

        let mut domains = std::collections::BTreeMap::new();
        domains.insert(
            "example.com".to_string(),
            DomainRecord {
                weekly_time: HOUR_MS - MINUTE_MS,
                weekly_limit: Some(HOUR_MS),
                ..DomainRecord::default()
            },
        );
        actor.storage.save_domains(&domains).await.unwrap();
        actor.tabs.insert(1, Domain::new("example.com"));
        actor.tabs.insert(2, Domain::new("example.com"));
        actor.tabs.insert(3, Domain::new("other.com"));

        // Push the domain over its weekly limit through the save path
        actor
            .storage
            .add_domain_time("example.com", 2 * MINUTE_MS, now_ms(), today_start())
            .await
            .unwrap();
        actor.check_and_enforce("example.com").await.unwrap();

        let record = actor.storage.domain("example.com").await.unwrap().unwrap();
        assert!(record.is_blocked);

        let mut overlay_tabs = Vec::new();
        while let Ok(directive) = directives.try_recv() {
            if let Directive::ShowOverlay { tab_id, domain } = directive {
                assert_eq!(domain, "example.com");
                overlay_tabs.push(tab_id);
            }
        }
        overlay_tabs.sort();
        assert_eq!(overlay_tabs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_daily_block_independent_of_weekly() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        let mut domains = std::collections::BTreeMap::new();
        domains.insert(
            "example.com".to_string(),
            DomainRecord {
                daily_time: HOUR_MS,
                daily_limit: Some(HOUR_MS),
                weekly_time: HOUR_MS,
                weekly_limit: Some(100 * HOUR_MS),
                ..DomainRecord::default()
            },
        );
        actor.storage.save_domains(&domains).await.unwrap();

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::CheckBlockStatus {
                domain: "example.com".to_string(),
                respond_to: tx,
            })
            .await;
        let (decision, _) = rx.await.unwrap().unwrap();
        assert_eq!(decision, Decision::Blocked { kind: LimitKind::Daily });
    }

    #[tokio::test]
    async fn test_reset_data_clears_session_and_store() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::ResetData { respond_to: tx })
            .await;
        assert!(rx.await.unwrap().is_ok());

        assert!(actor.session_for_test().is_none());
        assert!(actor.storage.domains().await.unwrap().is_empty());
        assert_eq!(
            actor.storage.settings().await.unwrap(),
            Settings::default()
        );
    }

    #[tokio::test]
    async fn test_stale_session_discarded_on_initialize() {
        let (mut actor, _rx) = test_actor();

        let stale = ActiveSession::start(Domain::new("example.com"), 5, 1_000);
        actor.storage.save_active_session(Some(&stale)).await.unwrap();

        actor.initialize().await.unwrap();
        assert!(actor.storage.active_session().await.unwrap().is_none());
        assert!(actor.session_for_test().is_none());
    }

    #[tokio::test]
    async fn test_pause_freezes_and_resume_continues() {
        let (mut actor, _rx) = test_actor();
        actor.initialize().await.unwrap();

        send_event(
            &mut actor,
            BrowserEvent::TabActivated {
                tab_id: 1,
                url: Some("https://example.com/".to_string()),
            },
        )
        .await;

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::PauseTracking { respond_to: tx })
            .await;
        assert!(rx.await.unwrap().is_ok());
        assert!(actor.session_for_test().unwrap().paused);

        // Flush tick is a no-op while paused
        actor.handle_for_test(EngineCommand::FlushTick).await;
        assert!(actor.storage.domains().await.unwrap().is_empty());

        let (tx, rx) = oneshot::channel();
        actor
            .handle_for_test(EngineCommand::ResumeTracking { respond_to: tx })
            .await;
        assert!(rx.await.unwrap().is_ok());
        assert!(!actor.session_for_test().unwrap().paused);
    }

    /// Store whose writes can be made to fail on demand.
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.fail_writes.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl StoreBackend for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key).await
        }

        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }

        async fn snapshot(
            &self,
        ) -> Result<std::collections::BTreeMap<String, serde_json::Value>, StoreError> {
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn test_failed_flush_retains_unlanded_time() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(64);
        let (directive_tx, _directive_rx) = broadcast::channel(64);
        let mut actor = EngineActor::new(
            rx,
            tx,
            Storage::new(store.clone() as Arc<dyn StoreBackend>),
            directive_tx,
        );
        actor.initialize().await.unwrap();

        // A session that has been running for a minute
        let start = now_ms() - MINUTE_MS;
        actor.session = Some(ActiveSession::start(Domain::new("example.com"), 1, start));

        store.set_failing(true);
        assert!(actor.handle_flush_tick().await.is_err());

        // The session was not rebased, so the minute is still pending
        let session = actor.session_for_test().unwrap();
        assert_eq!(session.start_time, start);
        assert!(session.elapsed(now_ms()) >= MINUTE_MS);
        assert!(actor.storage.domains().await.unwrap().is_empty());

        // Once the store recovers, the next tick lands the full amount
        store.set_failing(false);
        actor.handle_flush_tick().await.unwrap();

        let record = actor.storage.domain("example.com").await.unwrap().unwrap();
        assert!(record.daily_time >= MINUTE_MS);
        let session = actor.session_for_test().unwrap();
        assert!(session.start_time > start);
        assert_eq!(session.accumulated_time, 0);
    }
}

//! Limit enforcement: evaluating records, flipping block flags, and
//! publishing overlay and notification directives.
//!
//! Enforcement is edge-triggered. A directive goes out only when a
//! domain transitions between blocked and unblocked, never on every
//! evaluation, so subscribers don't see a storm of repeat overlays.

use tracing::{debug, info};

use timegate_core::{evaluate, Decision, Settings, TabId};
use timegate_protocol::Directive;

use super::actor::{now_ms, EngineActor};
use super::commands::EngineError;

impl EngineActor {
    /// Re-evaluates a domain after its counters or limits changed and
    /// applies any block or unblock transition.
    pub(super) async fn check_and_enforce(&mut self, domain: &str) -> Result<(), EngineError> {
        let record = match self.storage.domain(domain).await? {
            Some(r) => r,
            None => return Ok(()),
        };

        let has_extension = self.clear_expired_extension(domain).await?;
        let decision = evaluate(&record, has_extension);
        let settings = self.storage.settings().await?;

        if decision.is_blocked() && !record.is_blocked {
            self.apply_block(domain, &settings, &decision).await?;
        } else if !decision.is_blocked() && record.is_blocked {
            self.apply_unblock(domain).await?;
        }

        if let Decision::Approaching { percentage, .. } = decision {
            // One-shot warning as usage crosses into the 90% band
            if percentage.floor() == 90.0 {
                self.notify(
                    &settings,
                    &format!("warning-{domain}"),
                    "Approaching limit",
                    &format!("{domain} has used {}% of its time limit", percentage.floor()),
                );
            }
        }

        Ok(())
    }

    /// Marks a domain blocked and tells subscribers to overlay its tabs.
    async fn apply_block(
        &mut self,
        domain: &str,
        settings: &Settings,
        decision: &Decision,
    ) -> Result<(), EngineError> {
        let mut domains = self.storage.domains().await?;
        if let Some(record) = domains.get_mut(domain) {
            record.is_blocked = true;
            record.last_updated = now_ms();
            self.storage.save_domains(&domains).await?;
        }

        info!(domain, reason = ?decision.reason(), "Domain blocked");

        for tab_id in self.tabs_for(domain) {
            self.send_directive(Directive::ShowOverlay {
                domain: domain.to_string(),
                tab_id,
            });
        }

        self.notify(
            settings,
            &format!("blocked-{domain}"),
            "Time limit reached",
            &format!("{domain} is now blocked"),
        );
        Ok(())
    }

    /// Clears a domain's block flag and tells subscribers to drop its
    /// overlays.
    async fn apply_unblock(&mut self, domain: &str) -> Result<(), EngineError> {
        let mut domains = self.storage.domains().await?;
        if let Some(record) = domains.get_mut(domain) {
            record.is_blocked = false;
            record.last_updated = now_ms();
            self.storage.save_domains(&domains).await?;
        }

        info!(domain, "Domain unblocked");

        for tab_id in self.tabs_for(domain) {
            self.send_directive(Directive::HideOverlay {
                domain: domain.to_string(),
                tab_id,
            });
            // The page under the overlay may have torn itself down
            self.send_directive(Directive::ReloadTab { tab_id });
        }
        Ok(())
    }

    /// Unblocks a domain if its record carries the block flag.
    /// Used by extension grants, which lift blocks immediately.
    pub(super) async fn unblock_if_blocked(&mut self, domain: &str) -> Result<(), EngineError> {
        match self.storage.domain(domain).await? {
            Some(record) if record.is_blocked => self.apply_unblock(domain).await,
            _ => Ok(()),
        }
    }

    /// Drops the domain's current extension if it has expired, then
    /// reports whether an unexpired one remains.
    pub(super) async fn clear_expired_extension(
        &mut self,
        domain: &str,
    ) -> Result<bool, EngineError> {
        let now = now_ms();
        let mut extensions = self.storage.extensions().await?;

        let record = match extensions.get_mut(domain) {
            Some(r) => r,
            None => return Ok(false),
        };

        if record.has_expired_extension(now) {
            record.current_extension = None;
            self.storage.save_extensions(&extensions).await?;
            debug!(domain, "Expired extension cleared");
            return Ok(false);
        }

        Ok(record.active_extension(now).is_some())
    }

    /// Periodic sweep: clears every expired extension and re-applies
    /// blocks for domains whose weekly budget is spent.
    ///
    /// Only the weekly limit re-blocks here. A daily-only breach under a
    /// just-expired extension stays unblocked until the domain's next
    /// counter save re-evaluates it.
    pub(super) async fn sweep_expired_extensions(&mut self) -> Result<(), EngineError> {
        self.storage.check_and_reset_week().await?;

        let now = now_ms();
        let mut extensions = self.storage.extensions().await?;

        let mut expired: Vec<String> = Vec::new();
        for (domain, record) in extensions.iter_mut() {
            if record.has_expired_extension(now) {
                record.current_extension = None;
                expired.push(domain.clone());
            }
        }

        if expired.is_empty() {
            return Ok(());
        }

        self.storage.save_extensions(&extensions).await?;
        debug!(count = expired.len(), "Expired extensions swept");

        let settings = self.storage.settings().await?;
        let domains = self.storage.domains().await?;
        for domain in expired {
            let weekly_spent = domains
                .get(&domain)
                .and_then(|r| r.weekly_limit.map(|limit| r.weekly_time >= limit))
                .unwrap_or(false);
            if weekly_spent {
                let record = domains.get(&domain).cloned().unwrap_or_default();
                let decision = evaluate(&record, false);
                if !record.is_blocked {
                    self.apply_block(&domain, &settings, &decision).await?;
                }
            }
        }

        Ok(())
    }

    /// Publishes a desktop notification directive if notifications are
    /// enabled in settings.
    pub(super) fn notify(&self, settings: &Settings, id: &str, title: &str, message: &str) {
        if !settings.notifications_enabled {
            return;
        }
        self.send_directive(Directive::Notify {
            id: id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    /// Tabs currently showing the given domain.
    fn tabs_for(&self, domain: &str) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .tabs
            .iter()
            .filter(|(_, d)| d.as_str() == domain)
            .map(|(id, _)| *id)
            .collect();
        tabs.sort_unstable();
        tabs
    }

    /// Broadcasts a directive. A send error just means nobody is
    /// subscribed right now, which is fine.
    fn send_directive(&self, directive: Directive) {
        let _ = self.directives.send(directive);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio::sync::{broadcast, mpsc};

    use timegate_core::{today_start, DomainRecord, ExtensionRecord, HOUR_MS, MINUTE_MS};
    use timegate_protocol::Directive;

    use super::super::actor::{now_ms, EngineActor};
    use crate::storage::Storage;
    use crate::store::MemoryStore;

    fn sweep_actor() -> (EngineActor, broadcast::Receiver<Directive>) {
        let (tx, rx) = mpsc::channel(16);
        let (directive_tx, directive_rx) = broadcast::channel(16);
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        (
            EngineActor::new(rx, tx, storage, directive_tx),
            directive_rx,
        )
    }

    async fn seed_expired_extension(actor: &EngineActor, domain: &str) {
        let mut extensions = actor.storage.extensions().await.unwrap();
        let mut record = ExtensionRecord::default();
        let long_ago = now_ms() - HOUR_MS;
        record.record_request(MINUTE_MS, String::new(), long_ago, 0);
        extensions.insert(domain.to_string(), record);
        actor.storage.save_extensions(&extensions).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_clears_expired_extension() {
        let (mut actor, _rx) = sweep_actor();
        actor.initialize().await.unwrap();
        seed_expired_extension(&actor, "example.com").await;

        actor.sweep_expired_extensions().await.unwrap();

        let extensions = actor.storage.extensions().await.unwrap();
        assert!(extensions["example.com"].current_extension.is_none());
    }

    #[tokio::test]
    async fn test_sweep_reblocks_weekly_breach_only() {
        let (mut actor, _rx) = sweep_actor();
        actor.initialize().await.unwrap();

        let mut domains = BTreeMap::new();
        domains.insert(
            "weekly.com".to_string(),
            DomainRecord {
                weekly_time: 2 * HOUR_MS,
                weekly_limit: Some(HOUR_MS),
                ..DomainRecord::default()
            },
        );
        domains.insert(
            "daily.com".to_string(),
            DomainRecord {
                daily_time: 2 * HOUR_MS,
                daily_limit: Some(HOUR_MS),
                weekly_limit: Some(100 * HOUR_MS),
                ..DomainRecord::default()
            },
        );
        actor.storage.save_domains(&domains).await.unwrap();

        seed_expired_extension(&actor, "weekly.com").await;
        seed_expired_extension(&actor, "daily.com").await;

        actor.sweep_expired_extensions().await.unwrap();

        let domains = actor.storage.domains().await.unwrap();
        assert!(domains["weekly.com"].is_blocked);
        // Daily breach waits for the next counter save to re-evaluate
        assert!(!domains["daily.com"].is_blocked);
    }

    #[tokio::test]
    async fn test_sweep_noop_when_nothing_expired() {
        let (mut actor, _rx) = sweep_actor();
        actor.initialize().await.unwrap();

        let mut extensions = BTreeMap::new();
        let mut record = ExtensionRecord::default();
        record.record_request(HOUR_MS, String::new(), now_ms(), 0);
        extensions.insert("example.com".to_string(), record);
        actor.storage.save_extensions(&extensions).await.unwrap();

        actor.sweep_expired_extensions().await.unwrap();

        let extensions = actor.storage.extensions().await.unwrap();
        assert!(extensions["example.com"].current_extension.is_some());
    }

    #[tokio::test]
    async fn test_warning_fires_once_entering_ninety_percent_band() {
        let (mut actor, mut directives) = sweep_actor();
        actor.initialize().await.unwrap();

        let mut domains = BTreeMap::new();
        domains.insert(
            "example.com".to_string(),
            DomainRecord {
                weekly_limit: Some(HOUR_MS),
                ..DomainRecord::default()
            },
        );
        actor.storage.save_domains(&domains).await.unwrap();

        // 54 of 60 minutes is exactly 90%
        actor
            .storage
            .add_domain_time("example.com", 54 * MINUTE_MS, now_ms(), today_start())
            .await
            .unwrap();
        actor.check_and_enforce("example.com").await.unwrap();

        match directives.try_recv() {
            Ok(Directive::Notify { id, message, .. }) => {
                assert_eq!(id, "warning-example.com");
                assert!(message.contains("90%"));
            }
            other => panic!("expected warning notification, got {other:?}"),
        }

        // Deeper into the band (55/60 = 91.7%) the warning stays quiet
        actor
            .storage
            .add_domain_time("example.com", MINUTE_MS, now_ms(), today_start())
            .await
            .unwrap();
        actor.check_and_enforce("example.com").await.unwrap();

        assert!(directives.try_recv().is_err());
    }
}

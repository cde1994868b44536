//! Key-recovery prober — retries failed API keys until they prove usable.
//!
//! Each failing key carries a durable recovery record. A cycle selects at
//! most `batch_cap` due entries, persists the attempt bookkeeping before
//! probing, then probes strictly one at a time. Only a success that yields
//! response text transitions the key back to active; an inconclusive or
//! failed attempt leaves the record in the error state with its deadline
//! untouched.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RecoverySettings;
use crate::monitor::cooldown::CooldownTracker;
use crate::monitor::CycleRunner;
use crate::probe::{ProbeOutcome, UpstreamProber};
use crate::registry::{
    Credential, CredentialPatch, CredentialRegistry, KeyStatus, RecoveryEntry, RecoveryPatch,
};

pub struct RecoveryMonitor {
    cfg: RecoverySettings,
    registry: Arc<dyn CredentialRegistry>,
    prober: Arc<dyn UpstreamProber>,
    cooldowns: CooldownTracker,
}

/// One due entry paired with its parent credential.
struct Candidate {
    credential: Credential,
    entry: RecoveryEntry,
}

impl RecoveryMonitor {
    pub fn new(
        cfg: RecoverySettings,
        registry: Arc<dyn CredentialRegistry>,
        prober: Arc<dyn UpstreamProber>,
    ) -> Self {
        let cooldowns = CooldownTracker::new(cfg.cooldown());
        Self {
            cfg,
            registry,
            prober,
            cooldowns,
        }
    }

    /// Due entries, capped at `batch_cap`. An entry past its recovery
    /// deadline stays in the error state for manual attention and is only
    /// logged here, never reattempted.
    fn select_due(&self, credentials: &[Credential], now: DateTime<Utc>) -> Vec<Candidate> {
        let mut due = Vec::new();
        'creds: for cred in credentials {
            if cred.platform != self.cfg.platform {
                continue;
            }
            for entry in &cred.api_keys {
                if entry.status != KeyStatus::Error {
                    continue;
                }
                let error_since = entry.error_since.unwrap_or(now);
                let deadline = entry
                    .recover_until
                    .unwrap_or(error_since + self.cfg.recovery_window());
                if now >= deadline {
                    warn!(
                        credential = %cred.id,
                        key = %entry.key_id,
                        deadline = %deadline.to_rfc3339(),
                        "Key past its recovery deadline — leaving in error state"
                    );
                    continue;
                }
                if entry.next_attempt_at.is_some_and(|at| at > now) {
                    continue;
                }
                if self.cooldowns.active(&cred.id) {
                    debug!(credential = %cred.id, key = %entry.key_id, "In cooldown — skipping");
                    continue;
                }
                due.push(Candidate {
                    credential: cred.clone(),
                    entry: entry.clone(),
                });
                if due.len() >= self.cfg.batch_cap {
                    break 'creds;
                }
            }
        }
        due
    }

    /// One attempt: persist the bookkeeping, probe, remediate.
    async fn attempt_one(&self, candidate: &Candidate) {
        let cred = &candidate.credential;
        let entry = &candidate.entry;
        let now = Utc::now();

        // First touch defaults the episode timestamps; afterwards they are
        // re-persisted verbatim so the deadline stays stable.
        let error_since = entry.error_since.unwrap_or(now);
        let recover_until = entry
            .recover_until
            .unwrap_or(error_since + self.cfg.recovery_window());

        let bookkeeping = RecoveryPatch {
            attempts: Some(entry.attempts + 1),
            error_since: Some(Some(error_since)),
            recover_until: Some(Some(recover_until)),
            last_attempt_at: Some(Some(now)),
            next_attempt_at: Some(Some(now + self.cfg.probe_interval())),
            ..Default::default()
        };
        if let Err(e) = self
            .registry
            .update_recovery_entry(&cred.id, &entry.key_id, bookkeeping)
            .await
        {
            warn!(credential = %cred.id, key = %entry.key_id, "Failed to persist attempt bookkeeping: {e:#}");
        }

        let outcome = self.prober.probe(cred, &entry.key, cred.shape).await;
        self.cooldowns.touch(&cred.id);

        let result_patch = match outcome {
            Ok(ProbeOutcome::Alive { text: Some(text) }) => {
                info!(credential = %cred.id, key = %entry.key_id, "Key recovered");
                self.reactivate_parent(cred).await;
                RecoveryPatch {
                    status: Some(KeyStatus::Active),
                    attempts: Some(0),
                    error_since: Some(None),
                    recover_until: Some(None),
                    next_attempt_at: Some(None),
                    last_result: Some(Some(format!("recovered: {text}"))),
                    ..Default::default()
                }
            }
            Ok(ProbeOutcome::Alive { text: None }) => {
                debug!(credential = %cred.id, key = %entry.key_id, "Probe succeeded but carried no text");
                result_note("inconclusive: no response text")
            }
            Ok(ProbeOutcome::Rejected { status, .. }) => {
                warn!(credential = %cred.id, key = %entry.key_id, status, "Recovery probe rejected");
                result_note(&format!("rejected: status {status}"))
            }
            Ok(ProbeOutcome::Unreachable { reason }) => {
                warn!(credential = %cred.id, key = %entry.key_id, "Recovery probe unreachable: {reason}");
                result_note(&format!("unreachable: {reason}"))
            }
            Err(e) => {
                warn!(credential = %cred.id, key = %entry.key_id, "Probe setup failed: {e:#}");
                result_note(&format!("setup failed: {e}"))
            }
        };

        if let Err(e) = self
            .registry
            .update_recovery_entry(&cred.id, &entry.key_id, result_patch)
            .await
        {
            warn!(credential = %cred.id, key = %entry.key_id, "Failed to persist probe result: {e:#}");
        }
    }

    /// Best-effort: flip the parent's schedulable flag back on if it was
    /// off. Never forces activation of a credential another subsystem
    /// intentionally disabled in a stronger way.
    async fn reactivate_parent(&self, cred: &Credential) {
        if cred.schedulable {
            return;
        }
        let patch = CredentialPatch {
            schedulable: Some(true),
            ..Default::default()
        };
        match self.registry.update_credential(&cred.id, patch).await {
            Ok(()) => info!(credential = %cred.id, "Reactivated parent credential"),
            Err(e) => warn!(credential = %cred.id, "Failed to reactivate parent: {e:#}"),
        }
    }
}

fn result_note(note: &str) -> RecoveryPatch {
    RecoveryPatch {
        last_result: Some(Some(note.to_string())),
        ..Default::default()
    }
}

#[async_trait]
impl CycleRunner for RecoveryMonitor {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn run_cycle(&self) -> Result<()> {
        self.cooldowns.sweep();
        let credentials = self.registry.list_credentials().await?;
        let due = self.select_due(&credentials, Utc::now());

        let mut attempted = 0usize;
        for candidate in &due {
            // An earlier attempt in this batch may have touched the same
            // credential already.
            if self.cooldowns.active(&candidate.credential.id) {
                debug!(
                    credential = %candidate.credential.id,
                    key = %candidate.entry.key_id,
                    "Credential probed earlier this cycle — deferring"
                );
                continue;
            }
            self.attempt_one(candidate).await;
            attempted += 1;
        }

        info!(
            candidates = credentials.len(),
            attempted, "Recovery cycle complete"
        );
        Ok(())
    }

    fn reset(&self) {
        self.cooldowns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testutil::MockProber;
    use crate::registry::testutil::{credential, failing_entry, MockRegistry};
    use chrono::Duration;

    fn settings() -> RecoverySettings {
        RecoverySettings {
            probe_interval_secs: 3_600,
            recovery_window_secs: 86_400,
            batch_cap: 5,
            // No spacing so multi-cycle tests are not blocked.
            cooldown_secs: 0,
            ..Default::default()
        }
    }

    fn monitor(
        cfg: RecoverySettings,
        registry: Arc<MockRegistry>,
        prober: Arc<MockProber>,
    ) -> RecoveryMonitor {
        RecoveryMonitor::new(cfg, registry, prober)
    }

    #[tokio::test]
    async fn recovered_key_goes_active_and_reactivates_parent() {
        let mut cred = credential("c1");
        cred.schedulable = false;
        let mut entry = failing_entry("k1");
        entry.attempts = 5;
        cred.api_keys = vec![entry];

        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let prober = Arc::new(MockProber::scripted(vec![Ok(ProbeOutcome::Alive {
            text: Some("hello".into()),
        })]));
        monitor(settings(), registry.clone(), prober.clone())
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(prober.probe_count(), 1);
        let (_, bearer, _) = prober.calls.lock().unwrap()[0].clone();
        assert_eq!(bearer, "sk-k1", "probe uses the key material as bearer");

        let after = registry.entry("c1", "k1");
        assert_eq!(after.status, KeyStatus::Active);
        assert_eq!(after.attempts, 0);
        assert!(after.error_since.is_none());
        assert!(after.recover_until.is_none());
        assert!(after.next_attempt_at.is_none());
        assert_eq!(after.last_result.as_deref(), Some("recovered: hello"));

        let cred_after = registry.get_credential("c1").await.unwrap().unwrap();
        assert!(cred_after.schedulable);
    }

    #[tokio::test]
    async fn failed_attempt_advances_bookkeeping_and_keeps_deadline() {
        let deadline = Utc::now() + Duration::hours(12);
        let mut entry = failing_entry("k1");
        entry.recover_until = Some(deadline);
        let mut cred = credential("c1");
        cred.api_keys = vec![entry];

        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let prober = Arc::new(MockProber::scripted(vec![
            Ok(ProbeOutcome::Unreachable {
                reason: "connection refused".into(),
            }),
            Ok(ProbeOutcome::Rejected {
                status: 401,
                reset_epoch: None,
            }),
        ]));
        let mon = monitor(settings(), registry.clone(), prober);

        mon.run_cycle().await.unwrap();
        let after_first = registry.entry("c1", "k1");
        assert_eq!(after_first.status, KeyStatus::Error);
        assert_eq!(after_first.attempts, 1);
        assert_eq!(after_first.recover_until, Some(deadline));
        assert_eq!(
            after_first.last_result.as_deref(),
            Some("unreachable: connection refused")
        );
        let next = after_first.next_attempt_at.unwrap();
        let delta = (next - Utc::now()).num_seconds();
        assert!((3_595..=3_600).contains(&delta), "advanced by probe interval");

        // A due second attempt keeps the deadline stable and counts up.
        registry
            .update_recovery_entry(
                "c1",
                "k1",
                RecoveryPatch {
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        mon.run_cycle().await.unwrap();
        let after_second = registry.entry("c1", "k1");
        assert_eq!(after_second.attempts, 2);
        assert_eq!(after_second.recover_until, Some(deadline));
        assert_eq!(after_second.last_result.as_deref(), Some("rejected: status 401"));
    }

    #[tokio::test]
    async fn first_touch_sets_episode_timestamps_once() {
        let mut entry = failing_entry("k1");
        entry.error_since = None;
        let mut cred = credential("c1");
        cred.api_keys = vec![entry];

        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let prober = Arc::new(MockProber::scripted(vec![Ok(ProbeOutcome::Rejected {
            status: 500,
            reset_epoch: None,
        })]));
        monitor(settings(), registry.clone(), prober)
            .run_cycle()
            .await
            .unwrap();

        let after = registry.entry("c1", "k1");
        let since = after.error_since.unwrap();
        let deadline = after.recover_until.unwrap();
        assert_eq!((deadline - since).num_seconds(), 86_400);
    }

    #[tokio::test]
    async fn inconclusive_success_stays_in_error_state() {
        let mut cred = credential("c1");
        cred.api_keys = vec![failing_entry("k1")];

        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let prober = Arc::new(MockProber::scripted(vec![Ok(ProbeOutcome::Alive {
            text: None,
        })]));
        monitor(settings(), registry.clone(), prober)
            .run_cycle()
            .await
            .unwrap();

        let after = registry.entry("c1", "k1");
        assert_eq!(after.status, KeyStatus::Error);
        assert_eq!(after.attempts, 1);
        assert_eq!(
            after.last_result.as_deref(),
            Some("inconclusive: no response text")
        );
        assert!(registry.credential_patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_cap_bounds_probes_per_cycle() {
        let creds = (0..4)
            .map(|i| {
                let mut cred = credential(&format!("c{i}"));
                cred.api_keys = vec![failing_entry("k")];
                cred
            })
            .collect();
        let registry = Arc::new(MockRegistry::with(creds));
        let prober = Arc::new(MockProber::scripted(vec![]));
        let cfg = RecoverySettings {
            batch_cap: 2,
            ..settings()
        };
        monitor(cfg, registry, prober.clone()).run_cycle().await.unwrap();
        assert_eq!(prober.probe_count(), 2);
    }

    #[tokio::test]
    async fn undue_past_deadline_and_healthy_entries_are_skipped() {
        let mut not_due = failing_entry("later");
        not_due.next_attempt_at = Some(Utc::now() + Duration::hours(1));
        let mut expired = failing_entry("expired");
        expired.error_since = Some(Utc::now() - Duration::days(3));
        let mut healthy = failing_entry("fine");
        healthy.status = KeyStatus::Active;
        let mut cred = credential("c1");
        cred.api_keys = vec![not_due, expired, healthy];
        let mut foreign = credential("c2");
        foreign.platform = "other".into();
        foreign.api_keys = vec![failing_entry("k")];

        let registry = Arc::new(MockRegistry::with(vec![cred, foreign]));
        let prober = Arc::new(MockProber::scripted(vec![]));
        monitor(settings(), registry, prober.clone())
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(prober.probe_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_limits_one_probe_per_credential_per_window() {
        let mut cred = credential("c1");
        cred.api_keys = vec![failing_entry("k1"), failing_entry("k2")];
        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let prober = Arc::new(MockProber::scripted(vec![]));
        let cfg = RecoverySettings {
            cooldown_secs: 600,
            ..settings()
        };
        monitor(cfg, registry, prober.clone()).run_cycle().await.unwrap();
        assert_eq!(prober.probe_count(), 1, "second key waits for the window");
    }
}

//! Keepalive monitor — periodic low-cost probes for OAuth sessions.
//!
//! A session with a positive quota countdown is already known-alive and
//! is never probed. Everything else that passes the ordered eligibility
//! predicates gets one minimal probe per cooldown window; the probe's
//! outcome drives rate-limit/overload remediation and a usage refresh.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::KeepaliveSettings;
use crate::monitor::cooldown::CooldownTracker;
use crate::monitor::CycleRunner;
use crate::probe::{ProbeOutcome, UpstreamProber};
use crate::registry::{
    AuthMode, Credential, CredentialRegistry, RateLimitState, SubscriptionTier,
    INFERENCE_MARKER, PROFILE_MARKER,
};
use crate::tokens::TokenBroker;
use crate::usage::{UsageSnapshot, UsageTelemetry};

/// HTTP statuses remediated specially.
const STATUS_RATE_LIMITED: u16 = 429;
const STATUS_OVERLOADED: u16 = 529;
const STATUS_UNAVAILABLE: u16 = 503;

/// Quota scope a keepalive probe can witness.
const RATE_LIMIT_SCOPE: &str = "requests";

pub struct KeepaliveMonitor {
    cfg: KeepaliveSettings,
    registry: Arc<dyn CredentialRegistry>,
    tokens: Arc<dyn TokenBroker>,
    usage: Arc<dyn UsageTelemetry>,
    prober: Arc<dyn UpstreamProber>,
    cooldowns: CooldownTracker,
}

impl KeepaliveMonitor {
    pub fn new(
        cfg: KeepaliveSettings,
        registry: Arc<dyn CredentialRegistry>,
        tokens: Arc<dyn TokenBroker>,
        usage: Arc<dyn UsageTelemetry>,
        prober: Arc<dyn UpstreamProber>,
    ) -> Self {
        let cooldowns = CooldownTracker::new(cfg.cooldown());
        Self {
            cfg,
            registry,
            tokens,
            usage,
            prober,
            cooldowns,
        }
    }

    fn flags_healthy(cred: &Credential) -> bool {
        cred.active
            && cred.schedulable
            && !cred.auto_stopped_quota
            && !cred.auto_stopped_rate_limit
            && cred.rate_limit_state != RateLimitState::Limited
            && cred.rate_limited_at.is_none()
            && cred.status.as_deref().map_or(true, |s| s == "active")
    }

    /// Ordered short-circuit predicate chain: platform, auth mode and
    /// capability markers, health flags, premium tier, cooldown.
    fn eligible(&self, cred: &Credential) -> bool {
        cred.platform == self.cfg.platform
            && cred.auth_mode == AuthMode::Session
            && cred.has_capability(PROFILE_MARKER)
            && cred.has_capability(INFERENCE_MARKER)
            && Self::flags_healthy(cred)
            && cred.tier() == Some(SubscriptionTier::Premium)
            && !self.cooldowns.active(&cred.id)
    }

    /// Usage-freshness gate. A positive countdown means already alive;
    /// a stale snapshot earns exactly one refresh round trip before the
    /// final decision.
    async fn needs_probe(&self, cred: &Credential) -> Result<bool> {
        let cached = UsageSnapshot::from_cached(cred);
        if cached.remaining_secs > 0 {
            debug!(
                credential = %cred.id,
                remaining_secs = cached.remaining_secs,
                "Quota window still counting down — session known alive"
            );
            return Ok(false);
        }
        if cached.is_stale(self.cfg.usage_freshness()) {
            let fresh = self.usage.refresh(cred).await?;
            return Ok(fresh.remaining_secs <= 0);
        }
        Ok(true)
    }

    /// Probe one credential and remediate. The cooldown timestamp is
    /// recorded on every exit path after the attempt, so a permanently
    /// broken credential cannot hot-loop.
    async fn probe_one(&self, cred: &Credential) {
        let bearer = match self.tokens.valid_bearer(&cred.id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!(credential = %cred.id, "No valid bearer token — skipping probe");
                return;
            }
            Err(e) => {
                warn!(credential = %cred.id, "Token lookup failed: {e:#}");
                return;
            }
        };

        let outcome = self.prober.probe(cred, &bearer, cred.shape).await;
        self.cooldowns.touch(&cred.id);

        match outcome {
            Err(e) => warn!(credential = %cred.id, "Probe setup failed: {e:#}"),
            Ok(ProbeOutcome::Alive { .. }) => {
                info!(credential = %cred.id, "Keepalive probe succeeded");
                // One refresh so the cached countdown reflects the probe.
                if let Err(e) = self.usage.refresh(cred).await {
                    warn!(credential = %cred.id, "Post-probe usage refresh failed: {e:#}");
                }
            }
            Ok(ProbeOutcome::Rejected {
                status: STATUS_RATE_LIMITED,
                reset_epoch,
            }) => {
                warn!(credential = %cred.id, reset_epoch, "Keepalive probe rate-limited");
                if let Err(e) = self
                    .registry
                    .mark_rate_limited(&cred.id, RATE_LIMIT_SCOPE, reset_epoch)
                    .await
                {
                    warn!(credential = %cred.id, "Failed to persist rate-limit mark: {e:#}");
                }
            }
            Ok(ProbeOutcome::Rejected {
                status: status @ (STATUS_OVERLOADED | STATUS_UNAVAILABLE),
                ..
            }) => {
                warn!(credential = %cred.id, status, "Upstream overloaded");
                if let Err(e) = self.registry.mark_overloaded(&cred.id).await {
                    warn!(credential = %cred.id, "Failed to persist overload mark: {e:#}");
                }
            }
            Ok(ProbeOutcome::Rejected { status, .. }) => {
                warn!(credential = %cred.id, status, "Keepalive probe rejected");
            }
            Ok(ProbeOutcome::Unreachable { reason }) => {
                warn!(credential = %cred.id, "Keepalive probe unreachable: {reason}");
            }
        }
    }
}

#[async_trait]
impl CycleRunner for KeepaliveMonitor {
    fn name(&self) -> &'static str {
        "keepalive"
    }

    async fn run_cycle(&self) -> Result<()> {
        self.cooldowns.sweep();
        let credentials = self.registry.list_credentials().await?;

        let mut probed = 0usize;
        for cred in credentials.iter().filter(|c| self.eligible(c)) {
            match self.needs_probe(cred).await {
                Ok(true) => {
                    self.probe_one(cred).await;
                    probed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(credential = %cred.id, "Usage gate failed: {e:#}"),
            }
        }

        info!(
            candidates = credentials.len(),
            probed, "Keepalive cycle complete"
        );
        Ok(())
    }

    fn reset(&self) {
        self.cooldowns.clear();
    }
}

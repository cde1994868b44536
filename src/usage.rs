//! Usage telemetry — quota-window snapshots for pooled credentials.
//!
//! A snapshot is derived and ephemeral: remaining seconds in the current
//! quota window plus the time it was captured. A positive remaining
//! countdown marks the credential as already known-alive, so the
//! keepalive monitor never probes it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::registry::{Credential, CredentialPatch, CredentialRegistry};
use crate::tokens::TokenBroker;
use crate::transport::fingerprint_headers;

/// Derived view of a credential's quota-window consumption.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    /// Seconds left until the active quota window resets; 0 when no
    /// window is active (or the cached value is unusable).
    pub remaining_secs: i64,
    pub checked_at: Option<DateTime<Utc>>,
}

impl UsageSnapshot {
    /// Build a snapshot from the raw cached fields on a credential.
    /// Malformed values are treated as absent, never as errors.
    pub fn from_cached(cred: &Credential) -> Self {
        let now = Utc::now();
        let remaining_secs = cred
            .usage_resets_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| (t.with_timezone(&Utc) - now).num_seconds().max(0))
            .unwrap_or(0);
        let checked_at = cred
            .usage_checked_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            remaining_secs,
            checked_at,
        }
    }

    /// Stale when the capture timestamp is missing, unparsable, or older
    /// than the freshness threshold.
    pub fn is_stale(&self, freshness: Duration) -> bool {
        match self.checked_at {
            Some(t) => Utc::now() - t > freshness,
            None => true,
        }
    }
}

// ── Telemetry seam ──────────────────────────────────────────────────

#[async_trait]
pub trait UsageTelemetry: Send + Sync {
    /// Fetch the raw usage record from the provider.
    async fn fetch_remote_usage(&self, cred: &Credential) -> Result<Value>;

    /// Derive a snapshot from a raw usage record.
    fn build_snapshot(&self, raw: &Value) -> UsageSnapshot;

    /// Cache the raw record on the credential through the registry.
    async fn persist_snapshot(&self, credential_id: &str, raw: &Value) -> Result<()>;

    /// One full refresh round trip: fetch, persist, rebuild.
    async fn refresh(&self, cred: &Credential) -> Result<UsageSnapshot> {
        let raw = self.fetch_remote_usage(cred).await?;
        self.persist_snapshot(&cred.id, &raw).await?;
        Ok(self.build_snapshot(&raw))
    }
}

// ── HTTP implementation ─────────────────────────────────────────────

pub struct HttpUsageService {
    client: reqwest::Client,
    endpoint: Option<String>,
    tokens: Arc<dyn TokenBroker>,
    registry: Arc<dyn CredentialRegistry>,
}

impl HttpUsageService {
    pub fn new(
        endpoint: Option<String>,
        timeout: std::time::Duration,
        tokens: Arc<dyn TokenBroker>,
        registry: Arc<dyn CredentialRegistry>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build usage telemetry client")?;
        Ok(Self {
            client,
            endpoint,
            tokens,
            registry,
        })
    }
}

#[async_trait]
impl UsageTelemetry for HttpUsageService {
    async fn fetch_remote_usage(&self, cred: &Credential) -> Result<Value> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            bail!("no usage endpoint configured");
        };
        let Some(bearer) = self.tokens.valid_bearer(&cred.id).await? else {
            bail!("no valid bearer token for usage fetch");
        };

        let resp = self
            .client
            .get(endpoint)
            .headers(fingerprint_headers(&cred.platform))
            .bearer_auth(bearer)
            .send()
            .await
            .context("Usage fetch failed")?;

        if !resp.status().is_success() {
            bail!("usage fetch rejected with status {}", resp.status());
        }
        resp.json().await.context("Usage response was not JSON")
    }

    fn build_snapshot(&self, raw: &Value) -> UsageSnapshot {
        let now = Utc::now();
        let remaining_secs = raw["five_hour"]["resets_at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| (t.with_timezone(&Utc) - now).num_seconds().max(0))
            .unwrap_or(0);
        UsageSnapshot {
            remaining_secs,
            checked_at: Some(now),
        }
    }

    async fn persist_snapshot(&self, credential_id: &str, raw: &Value) -> Result<()> {
        let resets_at = raw["five_hour"]["resets_at"].as_str().map(str::to_owned);
        self.registry
            .update_credential(
                credential_id,
                CredentialPatch {
                    usage_resets_at: Some(resets_at),
                    usage_checked_at: Some(Some(Utc::now().to_rfc3339())),
                    ..Default::default()
                },
            )
            .await
    }
}

//! Credential registry — data model and the persistence seam.
//!
//! The registry owns credential records (OAuth sessions and static API
//! keys) and their per-key recovery entries. The monitors only hold
//! transient references during a cycle; every durable change goes through
//! the `CredentialRegistry` trait as a partial update so unrelated fields
//! are never clobbered.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod store;

/// Scope marker a session must declare to be probed for profile access.
pub const PROFILE_MARKER: &str = "profile";
/// Scope marker a session must declare to be probed for inference access.
pub const INFERENCE_MARKER: &str = "inference";

// ── Enums ───────────────────────────────────────────────────────────

/// How a credential authenticates against its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// OAuth session with a refreshable bearer token.
    Session,
    /// Static API key.
    StaticKey,
}

/// Rate-limit verdict last recorded for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitState {
    Ok,
    Limited,
}

/// Which upstream request envelope a credential speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolShape {
    /// Chat-message envelope (`messages` array).
    Chat,
    /// Structured-response envelope (`input` + `instructions`).
    Structured,
}

/// Subscription tier parsed from credential metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Premium,
    Standard,
}

/// Recovery lifecycle of a single API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Error,
}

// ── Records ─────────────────────────────────────────────────────────

/// Outbound proxy for a credential's traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub scheme: String, // "http" | "https" | "socks5"
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A pooled upstream credential.
///
/// Cached usage fields (`usage_resets_at`, `usage_checked_at`) are stored
/// raw and may be malformed; callers must parse them tolerantly.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    /// Provider family tag, e.g. "anthropic".
    pub platform: String,
    pub auth_mode: AuthMode,
    pub shape: ProtocolShape,
    /// Declared capability/scope set, e.g. "user:profile".
    pub scopes: Vec<String>,
    pub active: bool,
    pub schedulable: bool,
    pub auto_stopped_quota: bool,
    pub auto_stopped_rate_limit: bool,
    pub rate_limit_state: RateLimitState,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub rate_limit_resets_at: Option<DateTime<Utc>>,
    pub overloaded_at: Option<DateTime<Utc>>,
    /// Generic status; absent or "active" means unimpaired.
    pub status: Option<String>,
    /// Possibly-serialized subscription metadata (JSON object or bare label).
    pub tier_raw: Option<String>,
    pub usage_resets_at: Option<String>,
    pub usage_checked_at: Option<String>,
    pub access_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub proxy: Option<ProxyDescriptor>,
    /// Per-API-key recovery sub-resources.
    pub api_keys: Vec<RecoveryEntry>,
}

impl Credential {
    /// True if the scope set carries the given capability marker.
    pub fn has_capability(&self, marker: &str) -> bool {
        self.scopes.iter().any(|s| s.contains(marker))
    }

    /// Tolerantly parsed subscription tier; parse failure is `None`.
    pub fn tier(&self) -> Option<SubscriptionTier> {
        parse_tier(self.tier_raw.as_deref())
    }
}

/// Durable recovery record for one API key of a credential.
///
/// Created implicitly on first failure, cleared on the cycle that observes
/// a successful probe with response text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub key_id: String,
    /// Key material sent as the probe bearer.
    pub key: String,
    pub status: KeyStatus,
    pub error_since: Option<DateTime<Utc>>,
    /// Recovery deadline, set once per error episode and never re-derived.
    pub recover_until: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
}

// ── Partial updates ─────────────────────────────────────────────────

/// Field-level patch for a credential. `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub schedulable: Option<bool>,
    pub auto_stopped_quota: Option<bool>,
    pub auto_stopped_rate_limit: Option<bool>,
    pub rate_limit_state: Option<RateLimitState>,
    pub rate_limited_at: Option<Option<DateTime<Utc>>>,
    pub rate_limit_resets_at: Option<Option<DateTime<Utc>>>,
    pub overloaded_at: Option<Option<DateTime<Utc>>>,
    pub status: Option<Option<String>>,
    pub usage_resets_at: Option<Option<String>>,
    pub usage_checked_at: Option<Option<String>>,
}

/// Field-level patch for a recovery entry, same semantics as
/// [`CredentialPatch`].
#[derive(Debug, Clone, Default)]
pub struct RecoveryPatch {
    pub status: Option<KeyStatus>,
    pub error_since: Option<Option<DateTime<Utc>>>,
    pub recover_until: Option<Option<DateTime<Utc>>>,
    pub attempts: Option<u32>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub last_attempt_at: Option<Option<DateTime<Utc>>>,
    pub last_result: Option<Option<String>>,
}

// ── Registry seam ───────────────────────────────────────────────────

/// Persistence collaborator for credentials and recovery entries.
///
/// Partial updates must not clobber unrelated fields; a concurrent
/// external mutation races last-writer-wins, which is acceptable for this
/// low-contention control-plane resource.
#[async_trait]
pub trait CredentialRegistry: Send + Sync {
    async fn list_credentials(&self) -> Result<Vec<Credential>>;

    async fn get_credential(&self, id: &str) -> Result<Option<Credential>>;

    async fn update_credential(&self, id: &str, patch: CredentialPatch) -> Result<()>;

    async fn update_recovery_entry(
        &self,
        credential_id: &str,
        key_id: &str,
        patch: RecoveryPatch,
    ) -> Result<()>;

    /// Mark a credential rate-limited for the given quota scope, with the
    /// provider-reported reset epoch when one was parsed.
    async fn mark_rate_limited(
        &self,
        id: &str,
        scope: &str,
        reset_epoch: Option<i64>,
    ) -> Result<()>;

    /// Softer, time-unspecified overload flag.
    async fn mark_overloaded(&self, id: &str) -> Result<()>;
}

// ── Tolerant tier parsing ───────────────────────────────────────────

/// Parse possibly-serialized subscription metadata into a tier.
///
/// Accepts a JSON object with a "tier" or "plan" field, a JSON string, or
/// a bare label. Anything unrecognized or malformed is `None`, never an
/// error.
pub fn parse_tier(raw: Option<&str>) -> Option<SubscriptionTier> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let label = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => v
            .get("tier")
            .or_else(|| v.get("plan"))
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .or_else(|| v.as_str().map(str::to_owned))?,
        Err(_) => raw.to_string(),
    };

    match label.to_ascii_lowercase().as_str() {
        "max" | "premium" | "enterprise" => Some(SubscriptionTier::Premium),
        "pro" | "standard" | "basic" | "free" => Some(SubscriptionTier::Standard),
        _ => None,
    }
}

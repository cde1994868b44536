//! Probe executor — minimal synthetic requests against a real upstream.
//!
//! Single-attempt semantics: the scheduler's periodicity is the retry
//! mechanism, so a probe never retries internally. The bounded request
//! timeout is the only latency limit.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use http::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::registry::{Credential, ProtocolShape};
use crate::transport::{build_transport, fingerprint_headers};

pub mod envelope;
pub mod extract;

/// Classified result of one probe.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// 2xx reply. `text` is the extracted fragment; `None` means the
    /// body carried no recognizable text (inconclusive, not a failure).
    Alive { text: Option<String> },
    /// Provider rejected the request.
    Rejected {
        status: u16,
        /// Epoch seconds at which the rate limit resets, when a header
        /// said so.
        reset_epoch: Option<i64>,
    },
    /// Network error or timeout; no status code to classify.
    Unreachable { reason: String },
}

/// Setup problems that abort a single attempt before anything is sent.
#[derive(Debug, Error)]
pub enum ProbeSetupError {
    #[error("no endpoint configured for the {0:?} protocol shape")]
    MissingEndpoint(ProtocolShape),
    #[error("failed to build outbound transport: {0}")]
    Transport(String),
}

#[async_trait]
pub trait UpstreamProber: Send + Sync {
    /// Send one synthetic request with the given bearer credential and
    /// classify the outcome. `Err` means the attempt could not even be
    /// set up; the cycle moves on to the next candidate.
    async fn probe(
        &self,
        cred: &Credential,
        bearer: &str,
        shape: ProtocolShape,
    ) -> Result<ProbeOutcome>;
}

// ── HTTP prober ─────────────────────────────────────────────────────

/// Everything the executor needs to build a probe request.
#[derive(Debug, Clone)]
pub struct ProbeProfile {
    pub chat_endpoint: Option<String>,
    pub structured_endpoint: Option<String>,
    pub chat_model: String,
    pub structured_model: String,
    pub prompt: String,
    /// Already gated by the config switch; `None` means disabled.
    pub system: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

pub struct HttpProber {
    profile: ProbeProfile,
}

impl HttpProber {
    pub fn new(profile: ProbeProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl UpstreamProber for HttpProber {
    async fn probe(
        &self,
        cred: &Credential,
        bearer: &str,
        shape: ProtocolShape,
    ) -> Result<ProbeOutcome> {
        let (endpoint, model) = match shape {
            ProtocolShape::Chat => (self.profile.chat_endpoint.as_deref(), &self.profile.chat_model),
            ProtocolShape::Structured => (
                self.profile.structured_endpoint.as_deref(),
                &self.profile.structured_model,
            ),
        };
        let endpoint = endpoint.ok_or(ProbeSetupError::MissingEndpoint(shape))?;

        let client = build_transport(cred.proxy.as_ref(), self.profile.timeout)
            .map_err(|e| ProbeSetupError::Transport(e.to_string()))?;

        let body = envelope::request_body(
            shape,
            model,
            &self.profile.prompt,
            self.profile.system.as_deref(),
            self.profile.max_tokens,
        );

        let resp = match client
            .post(endpoint)
            .headers(fingerprint_headers(&cred.platform))
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(ProbeOutcome::Unreachable {
                    reason: e.to_string(),
                })
            }
        };

        let status = resp.status();
        if status.is_success() {
            let text = match resp.json::<extract::ProbeReply>().await {
                Ok(reply) => extract::extract_text(&reply),
                Err(e) => {
                    debug!(credential = %cred.id, "2xx probe body was not parseable JSON: {e}");
                    None
                }
            };
            return Ok(ProbeOutcome::Alive { text });
        }

        let reset_epoch = parse_reset_epoch(resp.headers());
        let code = status.as_u16();
        let snippet: String = resp
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        debug!(credential = %cred.id, status = code, body = %snippet, "Probe rejected");
        Ok(ProbeOutcome::Rejected {
            status: code,
            reset_epoch,
        })
    }
}

/// Reset time from rate-limit headers: an absolute epoch from the
/// provider-specific headers, else a relative Retry-After.
fn parse_reset_epoch(headers: &HeaderMap) -> Option<i64> {
    for name in ["anthropic-ratelimit-unified-reset", "x-ratelimit-reset"] {
        if let Some(epoch) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
        {
            return Some(epoch);
        }
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|secs| Utc::now().timestamp() + secs)
}

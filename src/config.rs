//! Configuration — YAML file with per-section defaults.
//!
//! Loaded from `$CREDPULSE_CONFIG` when set, else `~/.credpulse/config.yaml`.
//! A missing file is not an error; every section falls back to defaults so
//! the daemon starts usable out of the box.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::probe::ProbeProfile;

pub const CONFIG_ENV: &str = "CREDPULSE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; defaults to `~/.credpulse`.
    pub data_dir: Option<PathBuf>,
    pub keepalive: KeepaliveSettings,
    pub recovery: RecoverySettings,
    pub probe: ProbeSettings,
}

impl Config {
    /// Resolve the config path and load it, falling back to defaults when
    /// no file exists yet.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) => PathBuf::from(p),
            None => default_config_path()?,
        };
        if !path.exists() {
            info!(path = %path.display(), "No config file found — using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join(".credpulse")),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("credpulse.db"))
    }
}

fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(".credpulse").join("config.yaml"))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

// ── Keepalive ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    pub enabled: bool,
    /// Provider family this monitor covers.
    pub platform: String,
    pub scan_interval_secs: u64,
    /// Minimum spacing between probes of one credential.
    pub cooldown_secs: i64,
    /// Cached usage older than this triggers a refresh round trip.
    pub usage_freshness_secs: i64,
    pub usage_endpoint: Option<String>,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            platform: "anthropic".to_string(),
            scan_interval_secs: 300,
            cooldown_secs: 1_800,
            usage_freshness_secs: 900,
            usage_endpoint: Some("https://api.anthropic.com/api/oauth/usage".to_string()),
        }
    }
}

impl KeepaliveSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs)
    }

    pub fn usage_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.usage_freshness_secs)
    }
}

// ── Recovery ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub platform: String,
    pub scan_interval_secs: u64,
    /// Spacing between attempts on one key.
    pub probe_interval_secs: i64,
    /// How long after the first failure a key keeps being retried.
    pub recovery_window_secs: i64,
    /// Upper bound on probes issued in one cycle.
    pub batch_cap: usize,
    pub cooldown_secs: i64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            platform: "anthropic".to_string(),
            scan_interval_secs: 600,
            probe_interval_secs: 3_600,
            recovery_window_secs: 86_400,
            batch_cap: 5,
            cooldown_secs: 300,
        }
    }
}

impl RecoverySettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn probe_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.probe_interval_secs)
    }

    pub fn recovery_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recovery_window_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs)
    }
}

// ── Probe request ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub chat_endpoint: Option<String>,
    pub structured_endpoint: Option<String>,
    pub chat_model: String,
    pub structured_model: String,
    pub prompt: String,
    pub system_instruction: String,
    pub system_instruction_enabled: bool,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            chat_endpoint: Some("https://api.anthropic.com/v1/messages".to_string()),
            structured_endpoint: Some("https://api.openai.com/v1/responses".to_string()),
            chat_model: "claude-3-5-haiku-20241022".to_string(),
            structured_model: "gpt-4o-mini".to_string(),
            prompt: "ping".to_string(),
            system_instruction: "Reply with a single word.".to_string(),
            system_instruction_enabled: true,
            max_tokens: 8,
            timeout_secs: 30,
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Executor profile with the system instruction already gated by its
    /// switch.
    pub fn profile(&self) -> ProbeProfile {
        ProbeProfile {
            chat_endpoint: self.chat_endpoint.clone(),
            structured_endpoint: self.structured_endpoint.clone(),
            chat_model: self.chat_model.clone(),
            structured_model: self.structured_model.clone(),
            prompt: self.prompt.clone(),
            system: self
                .system_instruction_enabled
                .then(|| self.system_instruction.clone()),
            max_tokens: self.max_tokens,
            timeout: self.timeout(),
        }
    }
}

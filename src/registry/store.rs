//! SQLite-backed credential registry.
//!
//! Timestamps are stored as RFC 3339 text and parsed back tolerantly;
//! enums as lowercase text. Partial updates build their SET clause from
//! the patch so untouched columns are never rewritten.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::{
    AuthMode, Credential, CredentialPatch, CredentialRegistry, KeyStatus, ProtocolShape,
    ProxyDescriptor, RateLimitState, RecoveryEntry, RecoveryPatch,
};

pub struct SqliteRegistry {
    db: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path).context("Failed to open registry database")?;

        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                auth_mode TEXT NOT NULL DEFAULT 'session',
                shape TEXT NOT NULL DEFAULT 'chat',
                scopes TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                schedulable INTEGER NOT NULL DEFAULT 1,
                auto_stopped_quota INTEGER NOT NULL DEFAULT 0,
                auto_stopped_rate_limit INTEGER NOT NULL DEFAULT 0,
                rate_limit_state TEXT NOT NULL DEFAULT 'ok',
                rate_limited_at TEXT,
                rate_limit_resets_at TEXT,
                rate_limit_scope TEXT,
                overloaded_at TEXT,
                status TEXT,
                tier TEXT,
                usage_resets_at TEXT,
                usage_checked_at TEXT,
                access_token TEXT,
                token_expires_at TEXT,
                proxy TEXT
            );

            CREATE TABLE IF NOT EXISTS recovery_entries (
                credential_id TEXT NOT NULL,
                key_id TEXT NOT NULL,
                key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                error_since TEXT,
                recover_until TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                last_attempt_at TEXT,
                last_result TEXT,
                PRIMARY KEY (credential_id, key_id),
                FOREIGN KEY (credential_id) REFERENCES credentials(id)
            );

            CREATE INDEX IF NOT EXISTS idx_recovery_status
                ON recovery_entries(status, next_attempt_at);
            ",
        )?;

        Ok(Self { db: Mutex::new(db) })
    }

    /// Insert or replace a full credential record (operator seeding).
    pub fn add_credential(&self, cred: &Credential) -> Result<()> {
        let proxy_json = cred
            .proxy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize proxy descriptor")?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO credentials
                (id, platform, auth_mode, shape, scopes, active, schedulable,
                 auto_stopped_quota, auto_stopped_rate_limit, rate_limit_state,
                 rate_limited_at, rate_limit_resets_at, overloaded_at, status,
                 tier, usage_resets_at, usage_checked_at, access_token,
                 token_expires_at, proxy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                cred.id,
                cred.platform,
                auth_mode_str(cred.auth_mode),
                shape_str(cred.shape),
                cred.scopes.join(" "),
                cred.active,
                cred.schedulable,
                cred.auto_stopped_quota,
                cred.auto_stopped_rate_limit,
                rate_limit_str(cred.rate_limit_state),
                cred.rate_limited_at.map(|t| t.to_rfc3339()),
                cred.rate_limit_resets_at.map(|t| t.to_rfc3339()),
                cred.overloaded_at.map(|t| t.to_rfc3339()),
                cred.status,
                cred.tier_raw,
                cred.usage_resets_at,
                cred.usage_checked_at,
                cred.access_token,
                cred.token_expires_at.map(|t| t.to_rfc3339()),
                proxy_json,
            ],
        )?;
        drop(db);

        for entry in &cred.api_keys {
            self.add_recovery_entry(&cred.id, entry)?;
        }
        tracing::info!(credential = %cred.id, platform = %cred.platform, "Credential added to registry");
        Ok(())
    }

    /// Insert or replace one recovery entry under a credential.
    pub fn add_recovery_entry(&self, credential_id: &str, entry: &RecoveryEntry) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO recovery_entries
                (credential_id, key_id, key, status, error_since, recover_until,
                 attempts, next_attempt_at, last_attempt_at, last_result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                credential_id,
                entry.key_id,
                entry.key,
                key_status_str(entry.status),
                entry.error_since.map(|t| t.to_rfc3339()),
                entry.recover_until.map(|t| t.to_rfc3339()),
                entry.attempts,
                entry.next_attempt_at.map(|t| t.to_rfc3339()),
                entry.last_attempt_at.map(|t| t.to_rfc3339()),
                entry.last_result,
            ],
        )?;
        Ok(())
    }

    fn load_entries(db: &Connection) -> Result<HashMap<String, Vec<RecoveryEntry>>> {
        let mut stmt = db.prepare(
            "SELECT credential_id, key_id, key, status, error_since, recover_until,
                    attempts, next_attempt_at, last_attempt_at, last_result
             FROM recovery_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            let credential_id: String = row.get(0)?;
            Ok((credential_id, entry_from_row(row)?))
        })?;

        let mut grouped: HashMap<String, Vec<RecoveryEntry>> = HashMap::new();
        for row in rows {
            let (credential_id, entry) = row?;
            grouped.entry(credential_id).or_default().push(entry);
        }
        Ok(grouped)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<RecoveryEntry> {
    let status_str: String = row.get(3)?;
    Ok(RecoveryEntry {
        key_id: row.get(1)?,
        key: row.get(2)?,
        status: match status_str.as_str() {
            "error" => KeyStatus::Error,
            _ => KeyStatus::Active,
        },
        error_since: parse_ts(row.get(4)?),
        recover_until: parse_ts(row.get(5)?),
        attempts: row.get(6)?,
        next_attempt_at: parse_ts(row.get(7)?),
        last_attempt_at: parse_ts(row.get(8)?),
        last_result: row.get(9)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let auth_mode_s: String = row.get(2)?;
    let shape_s: String = row.get(3)?;
    let scopes_s: String = row.get(4)?;
    let rl_state_s: String = row.get(9)?;
    let proxy_s: Option<String> = row.get(19)?;

    Ok(Credential {
        id: row.get(0)?,
        platform: row.get(1)?,
        auth_mode: match auth_mode_s.as_str() {
            "static_key" => AuthMode::StaticKey,
            _ => AuthMode::Session,
        },
        shape: match shape_s.as_str() {
            "structured" => ProtocolShape::Structured,
            _ => ProtocolShape::Chat,
        },
        scopes: scopes_s.split_whitespace().map(str::to_owned).collect(),
        active: row.get(5)?,
        schedulable: row.get(6)?,
        auto_stopped_quota: row.get(7)?,
        auto_stopped_rate_limit: row.get(8)?,
        rate_limit_state: match rl_state_s.as_str() {
            "limited" => RateLimitState::Limited,
            _ => RateLimitState::Ok,
        },
        rate_limited_at: parse_ts(row.get(10)?),
        rate_limit_resets_at: parse_ts(row.get(11)?),
        overloaded_at: parse_ts(row.get(12)?),
        status: row.get(13)?,
        tier_raw: row.get(14)?,
        usage_resets_at: row.get(15)?,
        usage_checked_at: row.get(16)?,
        access_token: row.get(17)?,
        token_expires_at: parse_ts(row.get(18)?),
        proxy: proxy_s.and_then(|s| serde_json::from_str::<ProxyDescriptor>(&s).ok()),
        api_keys: Vec::new(),
    })
}

const CREDENTIAL_COLUMNS: &str = "id, platform, auth_mode, shape, scopes, active, schedulable, \
     auto_stopped_quota, auto_stopped_rate_limit, rate_limit_state, rate_limited_at, \
     rate_limit_resets_at, overloaded_at, status, tier, usage_resets_at, usage_checked_at, \
     access_token, token_expires_at, proxy";

fn auth_mode_str(mode: AuthMode) -> &'static str {
    match mode {
        AuthMode::Session => "session",
        AuthMode::StaticKey => "static_key",
    }
}

fn shape_str(shape: ProtocolShape) -> &'static str {
    match shape {
        ProtocolShape::Chat => "chat",
        ProtocolShape::Structured => "structured",
    }
}

fn rate_limit_str(state: RateLimitState) -> &'static str {
    match state {
        RateLimitState::Ok => "ok",
        RateLimitState::Limited => "limited",
    }
}

fn key_status_str(status: KeyStatus) -> &'static str {
    match status {
        KeyStatus::Active => "active",
        KeyStatus::Error => "error",
    }
}

// ── Patch assembly ──────────────────────────────────────────────────

struct SetClause {
    fragments: Vec<String>,
    values: Vec<Box<dyn ToSql>>,
}

impl SetClause {
    fn new() -> Self {
        Self {
            fragments: Vec::new(),
            values: Vec::new(),
        }
    }

    fn set<T: ToSql + 'static>(&mut self, column: &str, value: T) {
        self.values.push(Box::new(value));
        self.fragments
            .push(format!("{} = ?{}", column, self.values.len()));
    }

    fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

fn opt_ts(v: &Option<DateTime<Utc>>) -> Option<String> {
    v.map(|t| t.to_rfc3339())
}

// ── Registry trait impl ─────────────────────────────────────────────

#[async_trait]
impl CredentialRegistry for SqliteRegistry {
    async fn list_credentials(&self) -> Result<Vec<Credential>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare(&format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials"))?;
        let mut creds = stmt
            .query_map([], credential_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut entries = Self::load_entries(&db)?;
        for cred in &mut creds {
            if let Some(keys) = entries.remove(&cred.id) {
                cred.api_keys = keys;
            }
        }
        Ok(creds)
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Credential>> {
        let db = self.db.lock().unwrap();
        let result = db.query_row(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
            params![id],
            credential_from_row,
        );
        let mut cred = match result {
            Ok(c) => c,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stmt = db.prepare(
            "SELECT credential_id, key_id, key, status, error_since, recover_until,
                    attempts, next_attempt_at, last_attempt_at, last_result
             FROM recovery_entries WHERE credential_id = ?1",
        )?;
        cred.api_keys = stmt
            .query_map(params![id], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some(cred))
    }

    async fn update_credential(&self, id: &str, patch: CredentialPatch) -> Result<()> {
        let mut clause = SetClause::new();
        if let Some(v) = patch.schedulable {
            clause.set("schedulable", v);
        }
        if let Some(v) = patch.auto_stopped_quota {
            clause.set("auto_stopped_quota", v);
        }
        if let Some(v) = patch.auto_stopped_rate_limit {
            clause.set("auto_stopped_rate_limit", v);
        }
        if let Some(v) = patch.rate_limit_state {
            clause.set("rate_limit_state", rate_limit_str(v));
        }
        if let Some(ref v) = patch.rate_limited_at {
            clause.set("rate_limited_at", opt_ts(v));
        }
        if let Some(ref v) = patch.rate_limit_resets_at {
            clause.set("rate_limit_resets_at", opt_ts(v));
        }
        if let Some(ref v) = patch.overloaded_at {
            clause.set("overloaded_at", opt_ts(v));
        }
        if let Some(ref v) = patch.status {
            clause.set("status", v.clone());
        }
        if let Some(ref v) = patch.usage_resets_at {
            clause.set("usage_resets_at", v.clone());
        }
        if let Some(ref v) = patch.usage_checked_at {
            clause.set("usage_checked_at", v.clone());
        }
        if clause.is_empty() {
            return Ok(());
        }

        clause.values.push(Box::new(id.to_string()));
        let sql = format!(
            "UPDATE credentials SET {} WHERE id = ?{}",
            clause.fragments.join(", "),
            clause.values.len()
        );
        let db = self.db.lock().unwrap();
        db.execute(&sql, params_from_iter(clause.values.iter().map(|v| v.as_ref())))?;
        Ok(())
    }

    async fn update_recovery_entry(
        &self,
        credential_id: &str,
        key_id: &str,
        patch: RecoveryPatch,
    ) -> Result<()> {
        let mut clause = SetClause::new();
        if let Some(v) = patch.status {
            clause.set("status", key_status_str(v));
        }
        if let Some(ref v) = patch.error_since {
            clause.set("error_since", opt_ts(v));
        }
        if let Some(ref v) = patch.recover_until {
            clause.set("recover_until", opt_ts(v));
        }
        if let Some(v) = patch.attempts {
            clause.set("attempts", v);
        }
        if let Some(ref v) = patch.next_attempt_at {
            clause.set("next_attempt_at", opt_ts(v));
        }
        if let Some(ref v) = patch.last_attempt_at {
            clause.set("last_attempt_at", opt_ts(v));
        }
        if let Some(ref v) = patch.last_result {
            clause.set("last_result", v.clone());
        }
        if clause.is_empty() {
            return Ok(());
        }

        clause.values.push(Box::new(credential_id.to_string()));
        clause.values.push(Box::new(key_id.to_string()));
        let sql = format!(
            "UPDATE recovery_entries SET {} WHERE credential_id = ?{} AND key_id = ?{}",
            clause.fragments.join(", "),
            clause.values.len() - 1,
            clause.values.len()
        );
        let db = self.db.lock().unwrap();
        db.execute(&sql, params_from_iter(clause.values.iter().map(|v| v.as_ref())))?;
        Ok(())
    }

    async fn mark_rate_limited(
        &self,
        id: &str,
        scope: &str,
        reset_epoch: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let resets_at = reset_epoch
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
            .map(|t| t.to_rfc3339());
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE credentials
             SET rate_limit_state = 'limited', rate_limited_at = ?1,
                 rate_limit_resets_at = ?2, rate_limit_scope = ?3,
                 auto_stopped_rate_limit = 1
             WHERE id = ?4",
            params![now, resets_at, scope, id],
        )?;
        tracing::warn!(credential = id, scope, reset_epoch, "Credential marked rate-limited");
        Ok(())
    }

    async fn mark_overloaded(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE credentials SET overloaded_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tracing::warn!(credential = id, "Credential marked overloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testutil;

    fn open_store() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRegistry::open(&dir.path().join("registry.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn credential_round_trip() {
        let (_dir, store) = open_store();
        let mut cred = testutil::credential("c1");
        cred.proxy = Some(ProxyDescriptor {
            scheme: "socks5".into(),
            host: "127.0.0.1".into(),
            port: 1080,
            username: Some("u".into()),
            password: Some("p".into()),
        });
        cred.api_keys.push(testutil::failing_entry("k1"));
        store.add_credential(&cred).unwrap();

        let loaded = store.get_credential("c1").await.unwrap().unwrap();
        assert_eq!(loaded.platform, "anthropic");
        assert_eq!(loaded.auth_mode, AuthMode::Session);
        assert_eq!(loaded.scopes, cred.scopes);
        assert_eq!(loaded.proxy.as_ref().unwrap().port, 1080);
        assert_eq!(loaded.api_keys.len(), 1);
        assert_eq!(loaded.api_keys[0].status, KeyStatus::Error);
    }

    #[tokio::test]
    async fn partial_update_preserves_untouched_fields() {
        let (_dir, store) = open_store();
        let mut cred = testutil::credential("c1");
        cred.api_keys.push(testutil::failing_entry("k1"));
        store.add_credential(&cred).unwrap();
        let before = store.get_credential("c1").await.unwrap().unwrap();

        store
            .update_recovery_entry(
                "c1",
                "k1",
                RecoveryPatch {
                    attempts: Some(7),
                    last_result: Some(Some("still failing".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = store.get_credential("c1").await.unwrap().unwrap();
        let entry = &after.api_keys[0];
        assert_eq!(entry.attempts, 7);
        assert_eq!(entry.last_result.as_deref(), Some("still failing"));
        // Untouched fields survive the partial write.
        assert_eq!(entry.status, KeyStatus::Error);
        assert_eq!(entry.key, before.api_keys[0].key);
        assert_eq!(entry.error_since, before.api_keys[0].error_since);
        assert_eq!(entry.next_attempt_at, before.api_keys[0].next_attempt_at);
    }

    #[tokio::test]
    async fn clearing_nullable_fields() {
        let (_dir, store) = open_store();
        let mut entry = testutil::failing_entry("k1");
        entry.next_attempt_at = Some(Utc::now());
        let mut cred = testutil::credential("c1");
        cred.api_keys.push(entry);
        store.add_credential(&cred).unwrap();

        store
            .update_recovery_entry(
                "c1",
                "k1",
                RecoveryPatch {
                    status: Some(KeyStatus::Active),
                    attempts: Some(0),
                    error_since: Some(None),
                    next_attempt_at: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entry = store.get_credential("c1").await.unwrap().unwrap().api_keys[0].clone();
        assert_eq!(entry.status, KeyStatus::Active);
        assert_eq!(entry.attempts, 0);
        assert!(entry.error_since.is_none());
        assert!(entry.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn mark_rate_limited_records_reset_time() {
        let (_dir, store) = open_store();
        store.add_credential(&testutil::credential("c1")).unwrap();

        store
            .mark_rate_limited("c1", "requests", Some(1_700_000_000))
            .await
            .unwrap();

        let cred = store.get_credential("c1").await.unwrap().unwrap();
        assert_eq!(cred.rate_limit_state, RateLimitState::Limited);
        assert!(cred.auto_stopped_rate_limit);
        assert_eq!(
            cred.rate_limit_resets_at.unwrap().timestamp(),
            1_700_000_000
        );
    }

    #[tokio::test]
    async fn malformed_timestamp_is_tolerated() {
        let (_dir, store) = open_store();
        let mut cred = testutil::credential("c1");
        cred.usage_checked_at = Some("not-a-timestamp".into());
        store.add_credential(&cred).unwrap();

        let loaded = store.get_credential("c1").await.unwrap().unwrap();
        assert_eq!(loaded.usage_checked_at.as_deref(), Some("not-a-timestamp"));
    }
}

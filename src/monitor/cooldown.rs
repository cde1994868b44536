//! Cooldown tracker — minimum spacing between probes per credential.
//!
//! Process-local and unpersisted. Each monitor owns exactly one tracker
//! and is the only mutator (the scheduler's single-flight guard makes
//! cycles exclusive), so a plain mutex-guarded map suffices.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

pub struct CooldownTracker {
    window: Duration,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record an action on the credential now.
    pub fn touch(&self, credential_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(credential_id.to_string(), Utc::now());
    }

    /// True while the credential is still inside its cooldown window.
    pub fn active(&self, credential_id: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(credential_id) {
            Some(last) => Utc::now() - *last < self.window,
            None => false,
        }
    }

    /// Drop records whose window has elapsed.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, last| now - *last < self.window);
    }

    /// Forget all cooldown history (scheduler stop).
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn touch_at(&self, credential_id: &str, at: DateTime<Utc>) {
        self.entries
            .lock()
            .unwrap()
            .insert(credential_id.to_string(), at);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

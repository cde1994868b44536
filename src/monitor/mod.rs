//! Monitor scheduling — single-flight periodic ticks.
//!
//! One scheduler drives one monitor. The in-flight guard is an atomic
//! test-and-set: a tick that fires while the previous cycle is still
//! executing is skipped, never queued. Cycle errors and panics are
//! logged and the timer keeps firing on schedule.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub mod cooldown;
pub mod keepalive;
pub mod recovery;

/// Floor for the scan interval; shorter configured values are clamped up
/// to prevent hammering the upstream.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// One monitor's per-cycle work.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> Result<()>;

    /// Drop per-cycle state (cooldown history) when the scheduler stops.
    fn reset(&self);
}

pub struct TickScheduler {
    runner: Arc<dyn CycleRunner>,
    enabled: bool,
    interval: Duration,
    in_flight: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, enabled: bool, interval: Duration) -> Self {
        Self {
            runner,
            enabled,
            interval: interval.max(MIN_SCAN_INTERVAL),
            in_flight: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the timer loop: one warm-up cycle shortly after start, then
    /// one cycle per clamped interval. No-op when disabled or already
    /// started.
    pub fn start(&self) {
        if !self.enabled {
            info!(monitor = self.runner.name(), "Monitor disabled — not starting");
            return;
        }
        let mut slot = self.handle.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let runner = Arc::clone(&self.runner);
        let in_flight = Arc::clone(&self.in_flight);
        let interval = self.interval;
        info!(
            monitor = runner.name(),
            interval_secs = interval.as_secs(),
            "Monitor starting"
        );

        *slot = Some(tokio::spawn(async move {
            // Small jitter so co-started monitors do not tick in lock-step.
            let warmup = Duration::from_millis(1_000 + rand::thread_rng().gen_range(0..2_000));
            tokio::time::sleep(warmup).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // First tick completes immediately: the warm-up cycle.
                ticker.tick().await;
                run_guarded(&runner, &in_flight).await;
            }
        }));
    }

    /// Cancel the timer, clear per-cycle state, reset the guard. Never
    /// interrupts a cycle that is already running. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
            info!(monitor = self.runner.name(), "Monitor stopped");
        }
        self.in_flight.store(false, Ordering::SeqCst);
        self.runner.reset();
    }
}

/// Run one cycle behind the single-flight guard. The cycle executes as
/// its own task so a scheduler abort cannot cut it short, and so a panic
/// surfaces as a join error instead of killing the timer loop.
async fn run_guarded(runner: &Arc<dyn CycleRunner>, in_flight: &Arc<AtomicBool>) {
    if in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!(monitor = runner.name(), "Previous cycle still running — skipping tick");
        return;
    }

    let cycle = tokio::spawn({
        let runner = Arc::clone(runner);
        async move { runner.run_cycle().await }
    });
    match cycle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(monitor = runner.name(), "Cycle failed: {e:#}"),
        Err(e) => error!(monitor = runner.name(), "Cycle panicked: {e}"),
    }
    in_flight.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct SlowRunner {
        runs: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl SlowRunner {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CycleRunner for SlowRunner {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn run_cycle(&self) -> Result<()> {
            let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reset(&self) {}
    }

    #[tokio::test]
    async fn overlapping_ticks_never_run_concurrently() {
        let runner: Arc<SlowRunner> = Arc::new(SlowRunner::new());
        let dyn_runner: Arc<dyn CycleRunner> = runner.clone();
        let guard = Arc::new(AtomicBool::new(false));

        let a = run_guarded(&dyn_runner, &guard);
        let b = run_guarded(&dyn_runner, &guard);
        tokio::join!(a, b);

        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1, "second tick skipped");
        assert!(!guard.load(Ordering::SeqCst), "guard cleared after cycle");
    }

    #[tokio::test]
    async fn guard_clears_even_when_cycle_fails() {
        struct FailingRunner;
        #[async_trait]
        impl CycleRunner for FailingRunner {
            fn name(&self) -> &'static str {
                "failing"
            }
            async fn run_cycle(&self) -> Result<()> {
                anyhow::bail!("boom")
            }
            fn reset(&self) {}
        }

        let runner: Arc<dyn CycleRunner> = Arc::new(FailingRunner);
        let guard = Arc::new(AtomicBool::new(false));
        run_guarded(&runner, &guard).await;
        assert!(!guard.load(Ordering::SeqCst));
        // The loop would keep ticking; a second run is accepted.
        run_guarded(&runner, &guard).await;
        assert!(!guard.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn interval_is_clamped_to_the_floor() {
        let runner: Arc<dyn CycleRunner> = Arc::new(SlowRunner::new());
        let sched = TickScheduler::new(runner, true, Duration::from_secs(1));
        assert_eq!(sched.interval, MIN_SCAN_INTERVAL);
        sched.stop(); // idempotent even when never started
        sched.stop();
    }

    #[tokio::test]
    async fn disabled_scheduler_never_spawns() {
        let runner: Arc<dyn CycleRunner> = Arc::new(SlowRunner::new());
        let sched = TickScheduler::new(runner, false, Duration::from_secs(60));
        sched.start();
        assert!(sched.handle.lock().unwrap().is_none());
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::probe::{ProbeOutcome, UpstreamProber};
    use crate::registry::{Credential, ProtocolShape};
    use crate::tokens::TokenBroker;
    use crate::usage::{UsageSnapshot, UsageTelemetry};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Prober that replays scripted outcomes and records every call.
    pub struct MockProber {
        outcomes: std::sync::Mutex<VecDeque<Result<ProbeOutcome>>>,
        pub calls: std::sync::Mutex<Vec<(String, String, ProtocolShape)>>,
    }

    impl MockProber {
        pub fn scripted(outcomes: Vec<Result<ProbeOutcome>>) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        pub fn probe_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UpstreamProber for MockProber {
        async fn probe(
            &self,
            cred: &Credential,
            bearer: &str,
            shape: ProtocolShape,
        ) -> Result<ProbeOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((cred.id.clone(), bearer.to_string(), shape));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ProbeOutcome::Alive {
                    text: Some("ok".into()),
                }))
        }
    }

    /// Broker handing out one fixed token, or nothing.
    pub struct MockBroker {
        pub token: Option<String>,
    }

    #[async_trait]
    impl TokenBroker for MockBroker {
        async fn valid_bearer(&self, _credential_id: &str) -> Result<Option<String>> {
            Ok(self.token.clone())
        }
    }

    /// Telemetry that reports a fixed remaining countdown after refresh
    /// and counts fetch round trips.
    pub struct MockUsage {
        pub remaining_after_refresh: i64,
        pub fetches: AtomicUsize,
    }

    impl MockUsage {
        pub fn remaining(remaining_after_refresh: i64) -> Self {
            Self {
                remaining_after_refresh,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UsageTelemetry for MockUsage {
        async fn fetch_remote_usage(&self, _cred: &Credential) -> Result<serde_json::Value> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }

        fn build_snapshot(&self, _raw: &serde_json::Value) -> UsageSnapshot {
            UsageSnapshot {
                remaining_secs: self.remaining_after_refresh,
                checked_at: Some(Utc::now()),
            }
        }

        async fn persist_snapshot(
            &self,
            _credential_id: &str,
            _raw: &serde_json::Value,
        ) -> Result<()> {
            Ok(())
        }
    }
}

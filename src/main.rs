//! CredPulse — health monitoring and self-healing for pooled AI-provider
//! credentials.
//!
//! Runs as a daemon with two independent monitors: a keepalive probe that
//! stops idle OAuth sessions from going stale and keeps cached quota
//! countdowns fresh, and a recovery prober that retries failed API keys
//! on a backoff schedule until they prove usable again.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

mod config;
mod monitor;
mod probe;
mod registry;
mod tokens;
mod transport;
mod usage;

use config::Config;
use monitor::keepalive::KeepaliveMonitor;
use monitor::recovery::RecoveryMonitor;
use monitor::TickScheduler;
use probe::HttpProber;
use registry::store::SqliteRegistry;
use registry::CredentialRegistry;
use tokens::RegistryTokenBroker;
use usage::HttpUsageService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (structured logs)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credpulse=info".into()),
        )
        .with_target(false)
        .init();

    info!("💓 CredPulse v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cfg = Config::load()?;

    // Ensure data directory exists
    std::fs::create_dir_all(cfg.data_dir()?)?;

    // ── Registry ────────────────────────────────────────────────────
    let registry: Arc<dyn CredentialRegistry> = Arc::new(
        SqliteRegistry::open(&cfg.db_path()?).context("Failed to open credential registry")?,
    );

    let credential_count = registry
        .list_credentials()
        .await
        .map(|c| c.len())
        .unwrap_or(0);
    info!("📦 Registry holds {} credential(s)", credential_count);

    // ── Collaborators ───────────────────────────────────────────────
    let tokens = Arc::new(RegistryTokenBroker::new(Arc::clone(&registry)));
    let usage = Arc::new(
        HttpUsageService::new(
            cfg.keepalive.usage_endpoint.clone(),
            cfg.probe.timeout(),
            tokens.clone(),
            Arc::clone(&registry),
        )
        .context("Failed to build usage telemetry service")?,
    );
    let prober = Arc::new(HttpProber::new(cfg.probe.profile()));

    // ── Monitors ────────────────────────────────────────────────────
    let keepalive = KeepaliveMonitor::new(
        cfg.keepalive.clone(),
        Arc::clone(&registry),
        tokens.clone(),
        usage,
        prober.clone(),
    );
    let keepalive_sched = TickScheduler::new(
        Arc::new(keepalive),
        cfg.keepalive.enabled,
        cfg.keepalive.scan_interval(),
    );

    let recovery = RecoveryMonitor::new(cfg.recovery.clone(), Arc::clone(&registry), prober);
    let recovery_sched = TickScheduler::new(
        Arc::new(recovery),
        cfg.recovery.enabled,
        cfg.recovery.scan_interval(),
    );

    keepalive_sched.start();
    recovery_sched.start();

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("CredPulse daemon ready — monitors running");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received — stopping monitors");
    keepalive_sched.stop();
    recovery_sched.stop();

    Ok(())
}

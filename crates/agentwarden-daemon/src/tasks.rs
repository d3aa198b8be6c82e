//! Periodic housekeeping: quarantine TTL purge, audit retention, and a
//! one-shot coverage check after startup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// How long expected interception layers get to register before the
/// daemon warns that enforcement coverage is degraded.
const COVERAGE_GRACE: Duration = Duration::from_secs(30);

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn spawn_purge_loop(engine: Arc<Engine>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.purge_expired() {
                Ok(0) => debug!("quarantine purge found nothing expired"),
                Ok(removed) => info!(removed, "purged expired quarantine entries"),
                Err(err) => warn!(err = %err, "quarantine purge failed"),
            }
        }
    });
}

pub fn spawn_retention_loop(audit_dir: std::path::PathBuf, retention_days: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match audit::writer::prune_rotated(&audit_dir, retention_days).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "pruned rotated audit logs past retention"),
                Err(err) => warn!(err = %err, "audit retention sweep failed"),
            }
        }
    });
}

/// Warns once if expected layers are still missing after the grace
/// period. Missing coverage never loosens enforcement; it only means
/// some action categories reach the engine unobserved.
pub fn spawn_coverage_watch(engine: Arc<Engine>) {
    tokio::spawn(async move {
        tokio::time::sleep(COVERAGE_GRACE).await;
        let missing = engine.coverage.degraded();
        if !missing.is_empty() {
            warn!(
                missing = missing.join(", "),
                "interception coverage degraded: expected layers never registered"
            );
        }
    });
}

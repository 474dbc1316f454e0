use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::lifecycle::LifecycleEvent;
use crate::engine::{Engine, EngineError};
use crate::model::{BookingStatus, Ms};
use crate::observability::SWEEP_CLOSED_TOTAL;

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<String>,
    /// Bookings that could not be expired, with the reason. Retried next tick.
    pub failed: Vec<(Ulid, EngineError)>,
}

/// Expire every pending booking whose deposit window closed at `now`.
/// Bookings that moved on since collection are skipped.
pub async fn sweep_once(engine: &Engine, now: Ms, grace: Ms) -> SweepReport {
    let stale = engine.collect_stale_pending(now, grace).await;
    expire_batch(engine, stale).await
}

/// Expire each collected booking on its own; one failure does not stop
/// the rest of the batch.
async fn expire_batch(engine: &Engine, stale: Vec<(Ulid, String)>) -> SweepReport {
    let mut report = SweepReport::default();
    for (id, code) in stale {
        let result = engine
            .transition(
                id,
                BookingStatus::PendingDeposit,
                LifecycleEvent::DepositWindowElapsed,
                None,
            )
            .await;
        match result {
            Ok(_) => {
                info!("expired unpaid booking {code}");
                metrics::counter!(SWEEP_CLOSED_TOTAL, "to" => "EXPIRED").increment(1);
                report.expired.push(code);
            }
            Err(EngineError::InvalidTransition { from, .. }) => {
                debug!("sweeper skip {code}: already {from}");
            }
            Err(e) => {
                warn!("sweeper could not expire {code}: {e}");
                report.failed.push((id, e));
            }
        }
    }
    report
}

/// Background task that expires unpaid bookings every `every`.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let grace = engine.policy().deposit_grace_ms;
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        let report = sweep_once(&engine, now, grace).await;
        if !report.expired.is_empty() || !report.failed.is_empty() {
            info!(
                "sweep: {} expired, {} failed",
                report.expired.len(),
                report.failed.len()
            );
        }
    }
}

/// Background task that compacts the WAL once `threshold` appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::Engine;

/// Expiry sweeper: every `period`, cancel holds whose TTL ran out.
/// Expired holds already stop blocking the moment they lapse; this only makes
/// the CANCELLED(EXPIRED) status durable.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let count = engine.sweep_expired().await;
        if count > 0 {
            info!("sweeper expired {count} hold(s)");
        }
    }
}

/// Compact the WAL once `threshold` appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

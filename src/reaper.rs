use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Background task that expires stale holds and completes elapsed sessions.
pub async fn run_sweep(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let (expired, completed) = engine.sweep_stale(now_ms()).await;
        if expired > 0 || completed > 0 {
            info!("sweep: expired {expired} holds, completed {completed} sessions");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the journal once enough appends have
/// accumulated since the last compaction. One per tenant.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("compactor stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_journal().await {
            Ok(()) => info!("journal compacted after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use ulid::Ulid;

    use crate::model::{SlotSpec, UserRole};
    use crate::notify::NotifyHub;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwire_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_resets_append_count() {
        let path = test_journal_path("resets_count.journal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());

        let expert = Ulid::new();
        engine
            .register_user(expert, "E".into(), "e@example.com".into(), UserRole::Expert)
            .await
            .unwrap();
        let date = chrono::NaiveDate::parse_from_str("2025-01-06", "%Y-%m-%d").unwrap();
        let start = chrono::NaiveTime::parse_from_str("09:00", "%H:%M").unwrap();
        let end = chrono::NaiveTime::parse_from_str("10:00", "%H:%M").unwrap();
        engine
            .set_date_slots(expert, expert, date, vec![SlotSpec { start, end, message: None }])
            .await
            .unwrap();

        assert!(engine.journal_appends_since_compact().await >= 2);
        engine.compact_journal().await.unwrap();
        assert_eq!(engine.journal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn compactor_exits_on_shutdown() {
        let path = test_journal_path("shutdown.journal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_compactor(engine, 1_000, token.clone()));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("compactor did not stop")
            .unwrap();
    }
}

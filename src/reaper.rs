use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;
use crate::model::Ms;

/// Background task that periodically reclaims abandoned holds. A failed sweep
/// is logged and simply runs again on the next tick.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, max_age_ms: Ms) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.sweep_expired_holds(max_age_ms).await {
            Ok(report) if report.removed_count > 0 || !report.expired_rentals.is_empty() => {
                info!(
                    "reaper removed {} hold(s), expired {} rental(s)",
                    report.removed_count,
                    report.expired_rentals.len()
                );
            }
            Ok(_) => {}
            Err(e) => error!("reaper sweep failed: {e}"),
        }
    }
}

/// Compact the journal whenever `threshold` records accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("journal compacted after {appends} appends"),
            Err(e) => error!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::payment::LocalPaymentProvider;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("holdfast_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str, hold_max_age_ms: Ms) -> Arc<Engine> {
        let settings = EngineSettings {
            hold_max_age_ms,
            ..EngineSettings::default()
        };
        Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                Arc::new(LocalPaymentProvider::new(false)),
                settings,
            )
            .unwrap(),
        )
    }

    fn weekday_span() -> Span {
        let date = NaiveDate::from_ymd_opt(2030, 1, 8).unwrap();
        Span::from_dates(date, date).unwrap()
    }

    #[tokio::test]
    async fn reaper_loop_reclaims_expired_hold() {
        let engine = engine("reaper_loop.wal", 20);
        let rid = Ulid::new();
        engine.create_resource(rid, "owner", None).await.unwrap();
        use chrono::Weekday::*;
        for weekday in [Mon, Tue, Wed, Thu, Fri, Sat, Sun] {
            engine
                .set_weekly_rule(rid, "owner", WeeklyRule::open_all_day(weekday))
                .await
                .unwrap();
        }
        engine
            .place_temporary_block(rid, weekday_span(), "pi_loop")
            .await
            .unwrap();

        let task = tokio::spawn(run_reaper(engine.clone(), Duration::from_millis(10), 20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        task.abort();

        assert!(engine.list_blocks(rid, None).await.unwrap().is_empty());
        assert!(!engine.remove_temporary_block("pi_loop").await.unwrap());
    }

    #[tokio::test]
    async fn compaction_resets_append_counter() {
        let engine = engine("compactor.wal", HOUR_MS);
        let rid = Ulid::new();
        engine.create_resource(rid, "owner", None).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(engine.get_resource(&rid).is_some());
    }
}

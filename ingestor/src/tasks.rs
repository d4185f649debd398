//! Scheduled sweeps running beside the ingestion path, each stopped by its
//! own cancellation token.

use crate::registry::SensorRegistry;
use crate::store::CounterStore;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Oldest instant still kept live: the start of the current month, moved
/// back `months - 1` months. `None` when retention is disabled.
pub fn retention_cutoff(now: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    if months == 0 {
        return None;
    }
    let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)?;
    let cutoff = month_start.checked_sub_months(Months::new(months - 1))?;
    Some(cutoff.and_hms_opt(0, 0, 0)?.and_utc())
}

pub fn spawn_retention(
    store: Arc<dyn CounterStore>,
    months: u32,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if months == 0 {
            info!("Retention archival disabled");
            return;
        }
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(cutoff) = retention_cutoff(Utc::now(), months) else {
                        continue;
                    };
                    match store.archive_before(cutoff).await {
                        Ok(0) => debug!(%cutoff, "Nothing to archive"),
                        Ok(moved) => info!(moved, %cutoff, "Archived old samples"),
                        Err(e) => error!(error = %e, "Retention sweep failed"),
                    }
                }
            }
        }
        debug!("Retention task stopped");
    })
}

pub fn spawn_liveness_sweep(
    registry: Arc<SensorRegistry>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let offline = registry.sweep(Utc::now());
                    if offline > 0 {
                        info!(offline, "Liveness sweep marked sensors offline");
                    }
                }
            }
        }
        debug!("Liveness task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::TelemetrySample;
    use chrono::TimeZone;

    #[test]
    fn test_retention_cutoff() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 15, 30, 0).unwrap();

        assert_eq!(retention_cutoff(now, 0), None);
        assert_eq!(
            retention_cutoff(now, 1),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            retention_cutoff(now, 3),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            retention_cutoff(now, 4),
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_retention_task_archives_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::days(400);
        store
            .insert_samples(&[TelemetrySample {
                id: 0,
                device_id: "pc-01".to_string(),
                location: "HQ".to_string(),
                sub_location: String::new(),
                in_count: 3,
                out_count: 1,
                capacity: 10,
                event_time: old,
            }])
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let handle = spawn_retention(store.clone(), 1, Duration::from_secs(3600), cancel.clone());
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.sample_count(), 0);
        assert_eq!(store.distinct_devices("HQ").await.unwrap(), vec!["pc-01".to_string()]);
    }
}

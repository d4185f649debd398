//! Sensor liveness cache, seeded once from the store and kept current by
//! ingestion.

use crate::errors::{Error, Result};
use crate::store::CounterStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorStatus {
    pub device_id: String,
    pub location: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

pub struct SensorRegistry {
    sensors: RwLock<HashMap<String, SensorStatus>>,
    init: OnceCell<()>,
    offline_after: chrono::Duration,
}

impl SensorRegistry {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            sensors: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
            offline_after: chrono::Duration::from_std(offline_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    /// Seeds the cache from each device's latest sample. Runs at most once;
    /// concurrent callers wait for the first one. A failed seed is retried on
    /// the next call.
    pub async fn ensure_initialized(&self, store: &dyn CounterStore) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                let states = store.latest_states(None).await?;
                let now = Utc::now();
                let mut sensors = self.sensors.write();
                for state in &states {
                    let seen = state.sample.event_time;
                    // Live observations made before seeding win.
                    sensors
                        .entry(state.sample.device_id.clone())
                        .or_insert_with(|| SensorStatus {
                            device_id: state.sample.device_id.clone(),
                            location: state.sample.location.clone(),
                            is_online: now - seen <= self.offline_after,
                            last_seen: seen,
                        });
                }
                info!(sensors = sensors.len(), "Sensor registry initialized");
                Ok::<(), Error>(())
            })
            .await
            .map(|_| ())
    }

    /// Records a sample seen at `seen_at`. The sensor is online only if its
    /// latest sample is within the cut-off at `now`, so replayed history does
    /// not revive a silent sensor.
    pub fn observe(
        &self,
        device_id: &str,
        location: &str,
        seen_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let mut sensors = self.sensors.write();
        let status = sensors
            .entry(device_id.to_string())
            .or_insert_with(|| SensorStatus {
                device_id: device_id.to_string(),
                location: location.to_string(),
                is_online: false,
                last_seen: seen_at,
            });
        if seen_at >= status.last_seen {
            status.last_seen = seen_at;
            status.location = location.to_string();
        }
        status.is_online = now - status.last_seen <= self.offline_after;
    }

    /// Marks sensors silent for longer than the cut-off as offline; returns
    /// how many went offline in this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut went_offline = 0;
        for status in self.sensors.write().values_mut() {
            if status.is_online && now - status.last_seen > self.offline_after {
                status.is_online = false;
                went_offline += 1;
                warn!(
                    device_id = %status.device_id,
                    location = %status.location,
                    last_seen = %status.last_seen,
                    "Sensor went offline"
                );
            }
        }
        went_offline
    }

    /// All known sensors ordered by device id.
    pub fn snapshot(&self) -> Vec<SensorStatus> {
        let mut sensors: Vec<SensorStatus> = self.sensors.read().values().cloned().collect();
        sensors.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        sensors
    }

    pub fn status(&self, device_id: &str) -> Option<SensorStatus> {
        self.sensors.read().get(device_id).cloned()
    }
}

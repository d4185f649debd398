//! Read and reset operations exposed over HTTP.

use crate::errors::{Error, Result};
use crate::metrics::RESETS_TOTAL;
use crate::model::{
    BuildingSummary, ChartPoint, LogicalOccupancy, ResetRecord, SamplePage, TrendPoint,
    TrendScope,
};
use crate::publisher::LivePublisher;
use crate::registry::{SensorRegistry, SensorStatus};
use crate::resolver::{resolve_state, summarize};
use crate::store::CounterStore;
use crate::trend::{self, Bucket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetFailure {
    pub device_id: String,
    pub error: String,
}

/// Outcome of resetting every device of a building. Partial success is a
/// normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildingResetReport {
    pub building: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<ResetFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceResets {
    pub latest: Option<ResetRecord>,
    pub in_range: Vec<ResetRecord>,
}

pub struct CounterService {
    store: Arc<dyn CounterStore>,
    publisher: Arc<LivePublisher>,
    registry: Arc<SensorRegistry>,
}

impl CounterService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        publisher: Arc<LivePublisher>,
        registry: Arc<SensorRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            registry,
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<String>> {
        self.store.list_devices().await
    }

    pub async fn list_locations(&self) -> Result<Vec<String>> {
        self.store.list_locations().await
    }

    /// Latest logical state of every device, or of one building's devices.
    pub async fn latest_devices(&self, building: Option<&str>) -> Result<Vec<LogicalOccupancy>> {
        let states = self.store.latest_states(None).await?;
        Ok(states
            .iter()
            .filter(|s| building.map_or(true, |b| s.sample.location == b))
            .map(resolve_state)
            .collect())
    }

    pub async fn building_summaries(&self) -> Result<Vec<BuildingSummary>> {
        Ok(summarize(&self.latest_devices(None).await?))
    }

    pub async fn device_trend(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<TrendPoint>> {
        let scope = TrendScope::Device(device_id.to_string());
        let window = self.window(&scope, from, to, bucket).await?;
        Ok(trend::trend(&window, bucket))
    }

    pub async fn location_trend(
        &self,
        location: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<TrendPoint>> {
        let scope = TrendScope::Location(location.to_string());
        let window = self.window(&scope, from, to, bucket).await?;
        Ok(trend::trend(&window, bucket))
    }

    /// Raw counters per reset segment, for charts.
    pub async fn device_chart(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<ChartPoint>> {
        let scope = TrendScope::Device(device_id.to_string());
        let window = self.window(&scope, from, to, bucket).await?;
        Ok(trend::segment_chart(&window, bucket))
    }

    /// Stored raw samples of a device, oldest first, capped at `limit`.
    pub async fn device_samples(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<SamplePage> {
        check_range(from, to)?;
        let scope = TrendScope::Device(device_id.to_string());
        self.store
            .samples_in_range(&scope, from, to, Some(limit))
            .await
    }

    async fn window(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<crate::model::TrendWindow> {
        check_range(from, to)?;
        let (from, to) = bucket.widen(from, to);
        self.store.trend_window(scope, from, to).await
    }

    pub async fn device_resets(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<DeviceResets> {
        check_range(from, to)?;
        Ok(DeviceResets {
            latest: self.store.latest_reset(device_id).await?,
            in_range: self.store.resets_in_range(device_id, from, to).await?,
        })
    }

    pub fn sensor_status(&self) -> Vec<SensorStatus> {
        self.registry.snapshot()
    }

    pub async fn sensor_status_seeded(&self) -> Result<Vec<SensorStatus>> {
        self.registry.ensure_initialized(self.store.as_ref()).await?;
        Ok(self.sensor_status())
    }

    /// Zeroes a device at its latest sample and notifies viewers.
    pub async fn reset_device(&self, device_id: &str) -> Result<ResetRecord> {
        let (reset, building) = self.record_reset(device_id).await?;
        match self.building_summaries().await {
            Ok(summaries) => {
                self.publisher
                    .publish_device_reset(&reset.device_id, &building, &summaries)
                    .await;
            }
            Err(e) => warn!(error = %e, "Reset recorded but summaries could not be refreshed"),
        }
        Ok(reset)
    }

    /// Resets every device ever seen at the building, one after another.
    /// A device that fails is reported and the others still proceed.
    pub async fn reset_building(&self, building: &str) -> Result<BuildingResetReport> {
        let devices = self.store.distinct_devices(building).await?;
        if devices.is_empty() {
            return Err(Error::NotFound(format!(
                "No devices found for building '{}'",
                building
            )));
        }

        let mut report = BuildingResetReport {
            building: building.to_string(),
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for device_id in devices {
            match self.record_reset(&device_id).await {
                Ok(_) => report.succeeded.push(device_id),
                Err(e) => {
                    warn!(device_id = %device_id, building, error = %e, "Device reset failed");
                    report.failed.push(ResetFailure {
                        device_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            building,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Building reset finished"
        );

        match self.building_summaries().await {
            Ok(summaries) => {
                self.publisher
                    .publish_building_reset(
                        building,
                        report.succeeded.len(),
                        report.failed.len(),
                        &summaries,
                    )
                    .await;
            }
            Err(e) => warn!(error = %e, "Building reset recorded but summaries could not be refreshed"),
        }
        Ok(report)
    }

    async fn record_reset(&self, device_id: &str) -> Result<(ResetRecord, String)> {
        let sample = self
            .store
            .latest_sample(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No telemetry for device '{}'", device_id)))?;

        let reset = ResetRecord {
            device_id: sample.device_id.clone(),
            reset_time: sample.event_time,
            reset_in_count: sample.in_count,
            reset_out_count: sample.out_count,
        };
        self.store.append_reset(&reset).await?;
        RESETS_TOTAL.inc();
        info!(
            device_id,
            reset_in = reset.reset_in_count,
            reset_out = reset.reset_out_count,
            "Device reset recorded"
        );
        Ok((reset, sample.location))
    }
}

fn check_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<()> {
    if from > to {
        return Err(Error::Validation(format!(
            "Range start {} is after its end {}",
            from, to
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::TelemetrySample;
    use crate::publisher::Hub;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn sample(device: &str, in_count: i64, out_count: i64, time: DateTime<Utc>) -> TelemetrySample {
        TelemetrySample {
            id: 0,
            device_id: device.to_string(),
            location: "HQ".to_string(),
            sub_location: "Lobby".to_string(),
            in_count,
            out_count,
            capacity: 50,
            event_time: time,
        }
    }

    fn service(store: Arc<MemoryStore>) -> CounterService {
        CounterService::new(
            store,
            Arc::new(LivePublisher::new(Arc::new(Hub::new(8)), Duration::from_secs(1))),
            Arc::new(SensorRegistry::new(Duration::from_secs(300))),
        )
    }

    #[tokio::test]
    async fn test_reset_zeroes_device_then_counts_from_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        store
            .insert_samples(&[sample("pc-01", 100, 40, at(9, 0))])
            .await
            .unwrap();

        let reset = service.reset_device("pc-01").await.unwrap();
        assert_eq!(reset.reset_in_count, 100);
        assert_eq!(service.latest_devices(None).await.unwrap()[0].logical_in, 0);

        store
            .insert_samples(&[sample("pc-01", 130, 45, at(10, 0))])
            .await
            .unwrap();
        let latest = service.latest_devices(Some("HQ")).await.unwrap();

        assert_eq!(latest[0].logical_in, 30);
        assert_eq!(latest[0].logical_out, 5);
        assert_eq!(latest[0].occupancy, 25);
    }

    #[tokio::test]
    async fn test_reset_unknown_device_is_not_found() {
        let service = service(Arc::new(MemoryStore::new()));

        let result = service.reset_device("ghost").await;

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reset_unknown_building_is_not_found() {
        let service = service(Arc::new(MemoryStore::new()));

        assert!(matches!(
            service.reset_building("Nowhere").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let service = service(Arc::new(MemoryStore::new()));

        let result = service
            .device_trend("pc-01", at(10, 0), at(9, 0), Bucket::Hour)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_device_samples_are_capped_but_report_full_total() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let samples: Vec<TelemetrySample> = (0..5)
            .map(|i| sample("pc-01", 10 + i64::from(i), 0, at(9, i * 10)))
            .collect();
        store.insert_samples(&samples).await.unwrap();
        store
            .insert_samples(&[sample("pc-02", 99, 0, at(9, 5))])
            .await
            .unwrap();

        let page = service
            .device_samples("pc-01", at(9, 0), at(10, 0), 2)
            .await
            .unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.samples.len(), 2);
        assert_eq!(page.samples[0].in_count, 10);
        assert_eq!(page.samples[1].in_count, 11);
    }

    #[tokio::test]
    async fn test_trend_range_is_widened_to_whole_buckets() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        store
            .insert_samples(&[
                sample("pc-01", 100, 0, at(9, 5)),
                sample("pc-01", 110, 0, at(9, 55)),
                sample("pc-01", 125, 0, at(10, 40)),
            ])
            .await
            .unwrap();

        // 09:30..10:10 widens to 09:00..11:00 and keeps every sample.
        let points = service
            .device_trend("pc-01", at(9, 30), at(10, 10), Bucket::Hour)
            .await
            .unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].bucket_start, at(9, 0));
        assert_eq!(points[0].delta_in, 10);
        assert_eq!(points[1].delta_in, 15);
    }
}

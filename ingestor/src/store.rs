use crate::errors::Result;
use crate::model::{
    DeviceState, ResetRecord, SamplePage, TelemetrySample, TrendScope, TrendWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Append-only log of counter samples and resets.
///
/// Methods returning more than one kind of row (`latest_states`,
/// `trend_window`) read from a single consistent snapshot. Archived samples
/// are invisible to every read except `distinct_devices`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Bulk insert; returns the number of rows written.
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<u64>;

    /// Most recent sample by `event_time`, insertion order breaking ties.
    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>>;

    async fn latest_reset(&self, device_id: &str) -> Result<Option<ResetRecord>>;

    async fn append_reset(&self, reset: &ResetRecord) -> Result<()>;

    /// Latest sample of each device (all devices when `device_ids` is `None`)
    /// joined with the latest reset taking effect at or before it.
    async fn latest_states(&self, device_ids: Option<&[String]>) -> Result<Vec<DeviceState>>;

    /// Samples of the scope with `from <= event_time < to`, ordered by device,
    /// time and insertion order, cut off after `limit` rows. `total` counts
    /// the whole range.
    async fn samples_in_range(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<SamplePage>;

    /// Resets of a device with `from <= reset_time < to`, oldest first.
    async fn resets_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResetRecord>>;

    /// In-range samples of the scope plus every reset of the devices involved
    /// with `reset_time < to`.
    async fn trend_window(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TrendWindow>;

    /// Devices ever seen at a location, archived history included.
    async fn distinct_devices(&self, location: &str) -> Result<Vec<String>>;

    async fn list_devices(&self) -> Result<Vec<String>>;

    async fn list_locations(&self) -> Result<Vec<String>>;

    /// Moves samples older than `cutoff` to the archive; returns rows moved.
    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

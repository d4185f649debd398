//! In-process counter store, used when no database is configured.

use crate::errors::{Error, Result};
use crate::model::{
    DeviceState, ResetRecord, SamplePage, TelemetrySample, TrendScope, TrendWindow,
};
use crate::store::CounterStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Tables {
    samples: Vec<TelemetrySample>,
    archive: Vec<TelemetrySample>,
    resets: Vec<ResetRecord>,
    next_id: i64,
}

impl Tables {
    fn latest_sample(&self, device_id: &str) -> Option<&TelemetrySample> {
        self.samples
            .iter()
            .filter(|s| s.device_id == device_id)
            .max_by_key(|s| (s.event_time, s.id))
    }

    /// Latest reset with `reset_time <= at`; later appends win ties.
    fn reset_at(&self, device_id: &str, at: DateTime<Utc>) -> Option<&ResetRecord> {
        self.resets
            .iter()
            .enumerate()
            .filter(|(_, r)| r.device_id == device_id && r.reset_time <= at)
            .max_by_key(|(i, r)| (r.reset_time, *i))
            .map(|(_, r)| r)
    }

    fn in_scope(scope: &TrendScope, sample: &TelemetrySample) -> bool {
        match scope {
            TrendScope::Device(id) => &sample.device_id == id,
            TrendScope::Location(location) => &sample.location == location,
        }
    }

    fn samples_in_range(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<TelemetrySample> {
        let mut samples: Vec<TelemetrySample> = self
            .samples
            .iter()
            .filter(|s| Self::in_scope(scope, s) && s.event_time >= from && s.event_time < to)
            .cloned()
            .collect();
        samples.sort_by(|a, b| {
            (&a.device_id, a.event_time, a.id).cmp(&(&b.device_id, b.event_time, b.id))
        });
        samples
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent inserts fail, to exercise persistence failures.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::Relaxed);
    }

    pub fn sample_count(&self) -> usize {
        self.tables.read().samples.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn insert_samples(&self, batch: &[TelemetrySample]) -> Result<u64> {
        if self.fail_inserts.load(Ordering::Relaxed) {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        let mut tables = self.tables.write();
        for sample in batch {
            tables.next_id += 1;
            let mut stored = sample.clone();
            stored.id = tables.next_id;
            tables.samples.push(stored);
        }
        Ok(batch.len() as u64)
    }

    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        Ok(self.tables.read().latest_sample(device_id).cloned())
    }

    async fn latest_reset(&self, device_id: &str) -> Result<Option<ResetRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .resets
            .iter()
            .enumerate()
            .filter(|(_, r)| r.device_id == device_id)
            .max_by_key(|(i, r)| (r.reset_time, *i))
            .map(|(_, r)| r.clone()))
    }

    async fn append_reset(&self, reset: &ResetRecord) -> Result<()> {
        self.tables.write().resets.push(reset.clone());
        Ok(())
    }

    async fn latest_states(&self, device_ids: Option<&[String]>) -> Result<Vec<DeviceState>> {
        let tables = self.tables.read();
        let devices: BTreeSet<&str> = tables
            .samples
            .iter()
            .map(|s| s.device_id.as_str())
            .filter(|id| device_ids.map_or(true, |ids| ids.iter().any(|wanted| wanted == id)))
            .collect();

        Ok(devices
            .into_iter()
            .filter_map(|id| tables.latest_sample(id))
            .map(|sample| DeviceState {
                reset: tables.reset_at(&sample.device_id, sample.event_time).cloned(),
                sample: sample.clone(),
            })
            .collect())
    }

    async fn samples_in_range(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<SamplePage> {
        let mut samples = self.tables.read().samples_in_range(scope, from, to);
        let total = samples.len() as u64;
        if let Some(limit) = limit {
            samples.truncate(limit);
        }
        Ok(SamplePage { samples, total })
    }

    async fn resets_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResetRecord>> {
        let tables = self.tables.read();
        let mut resets: Vec<ResetRecord> = tables
            .resets
            .iter()
            .filter(|r| r.device_id == device_id && r.reset_time >= from && r.reset_time < to)
            .cloned()
            .collect();
        resets.sort_by_key(|r| r.reset_time);
        Ok(resets)
    }

    async fn trend_window(
        &self,
        scope: &TrendScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TrendWindow> {
        let tables = self.tables.read();
        let samples = tables.samples_in_range(scope, from, to);
        let devices: BTreeSet<&str> = samples.iter().map(|s| s.device_id.as_str()).collect();
        let mut resets: Vec<ResetRecord> = tables
            .resets
            .iter()
            .filter(|r| devices.contains(r.device_id.as_str()) && r.reset_time < to)
            .cloned()
            .collect();
        resets.sort_by(|a, b| (&a.device_id, a.reset_time).cmp(&(&b.device_id, b.reset_time)));
        Ok(TrendWindow { samples, resets })
    }

    async fn distinct_devices(&self, location: &str) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let devices: BTreeSet<String> = tables
            .samples
            .iter()
            .chain(tables.archive.iter())
            .filter(|s| s.location == location)
            .map(|s| s.device_id.clone())
            .collect();
        Ok(devices.into_iter().collect())
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let devices: BTreeSet<String> = tables.samples.iter().map(|s| s.device_id.clone()).collect();
        Ok(devices.into_iter().collect())
    }

    async fn list_locations(&self) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let locations: BTreeSet<&str> = tables.samples.iter().map(|s| s.location.as_str()).collect();
        Ok(locations.into_iter().map(str::to_string).collect())
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let (old, live): (Vec<TelemetrySample>, Vec<TelemetrySample>) = tables
            .samples
            .drain(..)
            .partition(|s| s.event_time < cutoff);
        let moved = old.len() as u64;
        tables.samples = live;
        tables.archive.extend(old);
        Ok(moved)
    }
}

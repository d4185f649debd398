use crate::batching::{BatchSink, RawMessage};
use crate::errors::Result;
use crate::metrics::{
    DB_FAILURES_TOTAL, INSERT_LATENCY_SECONDS, SAMPLES_TOTAL, SKIPPED_MESSAGES_TOTAL,
    SKIPPED_SAMPLES_TOTAL,
};
use crate::model::LogicalOccupancy;
use crate::publisher::{FanOutReport, LivePublisher};
use crate::registry::SensorRegistry;
use crate::resolver::{resolve_state, summarize};
use crate::store::CounterStore;
use crate::validate::parse_payload;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub messages: usize,
    pub samples: usize,
    /// Messages that were not valid JSON.
    pub skipped_messages: usize,
    /// Readings rejected for a bad timestamp or invalid values.
    pub skipped_samples: usize,
    /// Distinct devices touched by the batch, sorted.
    pub devices: Vec<String>,
    pub fan_out: FanOutReport,
}

/// Parse, persist, recompute and publish one batch.
pub struct BatchProcessor {
    store: Arc<dyn CounterStore>,
    publisher: Arc<LivePublisher>,
    registry: Arc<SensorRegistry>,
}

impl BatchProcessor {
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

    pub async fn process_batch(&self, batch: &[RawMessage]) -> Result<BatchReport> {
        let started = Instant::now();
        let mut report = BatchReport {
            messages: batch.len(),
            ..Default::default()
        };

        let mut samples = Vec::new();
        for message in batch {
            match parse_payload(&message.payload) {
                Ok(parsed) => {
                    report.skipped_samples += parsed.skipped;
                    samples.extend(parsed.samples);
                }
                Err(e) => {
                    report.skipped_messages += 1;
                    warn!(topic = %message.topic, error = %e, "Skipping malformed message");
                }
            }
        }
        SKIPPED_MESSAGES_TOTAL.inc_by(report.skipped_messages as u64);
        SKIPPED_SAMPLES_TOTAL.inc_by(report.skipped_samples as u64);

        if samples.is_empty() {
            warn!(
                messages = report.messages,
                skipped_messages = report.skipped_messages,
                skipped_samples = report.skipped_samples,
                "Batch contained no valid samples"
            );
            return Ok(report);
        }

        let insert_started = Instant::now();
        match self.store.insert_samples(&samples).await {
            Ok(inserted) => {
                INSERT_LATENCY_SECONDS.observe(insert_started.elapsed().as_secs_f64());
                SAMPLES_TOTAL.inc_by(inserted);
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!(
                    dropped = samples.len(),
                    error = %e,
                    "Failed to persist batch, samples dropped"
                );
                return Err(e);
            }
        }
        let insert_ms = insert_started.elapsed().as_millis() as u64;
        report.samples = samples.len();

        if let Err(e) = self.registry.ensure_initialized(self.store.as_ref()).await {
            warn!(error = %e, "Sensor registry seed failed, will retry next batch");
        }
        let now = Utc::now();
        for sample in &samples {
            self.registry
                .observe(&sample.device_id, &sample.location, sample.event_time, now);
        }

        let devices: BTreeSet<&str> = samples.iter().map(|s| s.device_id.as_str()).collect();
        report.devices = devices.into_iter().map(str::to_string).collect();

        let recompute_started = Instant::now();
        let updates: Vec<LogicalOccupancy> = self
            .store
            .latest_states(Some(report.devices.as_slice()))
            .await?
            .iter()
            .map(resolve_state)
            .collect();
        let everyone: Vec<LogicalOccupancy> = self
            .store
            .latest_states(None)
            .await?
            .iter()
            .map(resolve_state)
            .collect();
        let summaries = summarize(&everyone);
        let recompute_ms = recompute_started.elapsed().as_millis() as u64;

        let fan_out_started = Instant::now();
        report.fan_out = self.publisher.publish_batch(&updates, &summaries).await;
        let fan_out_ms = fan_out_started.elapsed().as_millis() as u64;

        info!(
            messages = report.messages,
            samples = report.samples,
            devices = report.devices.len(),
            skipped = report.skipped_messages + report.skipped_samples,
            insert_ms,
            recompute_ms,
            fan_out_ms,
            total_ms = started.elapsed().as_millis() as u64,
            "Processed batch"
        );
        Ok(report)
    }
}

#[async_trait]
impl BatchSink for BatchProcessor {
    async fn process(&self, batch: Vec<RawMessage>) {
        match self.process_batch(&batch).await {
            Ok(report) => debug!(samples = report.samples, "Batch done"),
            Err(e) => error!(messages = batch.len(), error = %e, "Batch processing failed"),
        }
    }
}

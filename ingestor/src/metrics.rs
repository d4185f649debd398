use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref SKIPPED_MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_skipped_messages_total",
        "Total messages that could not be decoded"
    ))
    .unwrap();
    pub static ref SKIPPED_SAMPLES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_skipped_samples_total",
        "Total readings rejected by validation"
    ))
    .unwrap();
    pub static ref SAMPLES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_samples_total",
        "Total samples persisted"
    ))
    .unwrap();
    pub static ref BATCHES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_batches_total",
        "Total batches handed to processing"
    ))
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "occupancy_batch_size",
        "Messages in the batch being processed"
    ))
    .unwrap();
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::with_opts(Opts::new(
        "occupancy_queue_depth",
        "Messages waiting in the ingestion queue"
    ))
    .unwrap();
    pub static ref QUEUE_WARNINGS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_queue_warnings_total",
        "Times the queue depth crossed the warning threshold"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_dropped_messages_total",
        "Messages dropped because the queue was closed"
    ))
    .unwrap();
    pub static ref INSERT_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "occupancy_insert_latency_seconds",
            "Time taken to insert a batch into the store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "occupancy_db_failures_total",
        "Total batch insert failures"
    ))
    .unwrap();
    pub static ref FANOUT_FAILURES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_fanout_failures_total",
        "Live publishes that failed or missed the deadline"
    ))
    .unwrap();
    pub static ref RESETS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "occupancy_resets_total",
        "Device resets recorded"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SKIPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SKIPPED_SAMPLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SAMPLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WARNINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INSERT_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FANOUT_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESETS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_are_exposed() {
        // Registration is process-wide; a second call only reports duplicates.
        let _ = init_metrics();
        RESETS_TOTAL.inc();

        let text = gather_metrics().unwrap();

        assert!(text.contains("occupancy_resets_total"));
        assert!(text.contains("occupancy_queue_depth"));
    }
}

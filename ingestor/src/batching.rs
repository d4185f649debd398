use crate::config::Config;
use crate::metrics::{BATCHES_TOTAL, BATCH_SIZE, DROPPED_MESSAGES_TOTAL, QUEUE_DEPTH, QUEUE_WARNINGS_TOTAL};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A transport payload waiting to be parsed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch: usize,
    pub interval: Duration,
    pub poll_interval: Duration,
    pub warn_depth: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            warn_depth: 500,
        }
    }
}

impl From<&Config> for BatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_batch: config.batch_size,
            interval: config.batch_interval,
            poll_interval: config.batch_poll,
            warn_depth: config.queue_warning_threshold,
        }
    }
}

/// Receives each non-empty batch, one at a time, on the consumer task.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn process(&self, batch: Vec<RawMessage>);
}

/// Producer side of the ingestion queue. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<RawMessage>,
    depth: Arc<AtomicUsize>,
    warn_depth: usize,
}

impl IngestHandle {
    pub fn enqueue(&self, message: RawMessage) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        QUEUE_DEPTH.set(depth as i64);
        if crosses_warning(depth, self.warn_depth) {
            QUEUE_WARNINGS_TOTAL.inc();
            warn!(
                depth,
                threshold = self.warn_depth,
                "Ingest queue depth above threshold, processing is falling behind"
            );
        }

        if self.tx.send(message).is_err() {
            let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
            QUEUE_DEPTH.set(depth as i64);
            DROPPED_MESSAGES_TOTAL.inc();
            debug!("Ingest queue closed, message dropped");
        }
    }

    /// Approximate number of messages enqueued but not yet taken into a batch.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// True once per `warn_depth` messages while the depth stays above it.
fn crosses_warning(depth: usize, warn_depth: usize) -> bool {
    depth > warn_depth && (depth - warn_depth - 1) % warn_depth == 0
}

/// Consumer side of the ingestion queue.
#[derive(Debug)]
pub struct Batcher {
    rx: mpsc::UnboundedReceiver<RawMessage>,
    depth: Arc<AtomicUsize>,
    config: BatcherConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatcherSummary {
    pub batches: u64,
    pub messages: u64,
    pub dropped: u64,
}

pub fn channel(config: BatcherConfig) -> (IngestHandle, Batcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let handle = IngestHandle {
        tx,
        depth: depth.clone(),
        warn_depth: config.warn_depth.max(1),
    };
    (handle, Batcher { rx, depth, config })
}

impl Batcher {
    pub async fn run(mut self, sink: Arc<dyn BatchSink>, shutdown: CancellationToken) -> BatcherSummary {
        info!(
            max_batch = self.config.max_batch,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting batcher"
        );

        let mut summary = BatcherSummary::default();
        while let Some(batch) = self.next_batch(&shutdown).await {
            summary.batches += 1;
            summary.messages += batch.len() as u64;
            BATCHES_TOTAL.inc();
            BATCH_SIZE.set(batch.len() as f64);
            sink.process(batch).await;
            BATCH_SIZE.set(0.0);

            if shutdown.is_cancelled() {
                break;
            }
        }

        self.rx.close();
        while self.rx.try_recv().is_ok() {
            summary.dropped += 1;
        }
        self.depth.store(0, Ordering::Relaxed);
        QUEUE_DEPTH.set(0);
        if summary.dropped > 0 {
            DROPPED_MESSAGES_TOTAL.inc_by(summary.dropped);
            warn!(dropped = summary.dropped, "Batcher stopped with messages still queued");
        }

        info!(
            batches = summary.batches,
            messages = summary.messages,
            "Batcher stopped"
        );
        summary
    }

    /// Waits for the first message, then collects until the batch is full or
    /// the interval has elapsed. `None` once shut down or every producer is gone.
    async fn next_batch(&mut self, shutdown: &CancellationToken) -> Option<Vec<RawMessage>> {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            message = self.rx.recv() => message?,
        };

        let max_batch = self.config.max_batch.max(1);
        let deadline = Instant::now() + self.config.interval;
        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);

        while batch.len() < max_batch && Instant::now() < deadline {
            match self.rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty) => {
                    let pause = self
                        .config
                        .poll_interval
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = sleep(pause) => {}
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        if !shutdown.is_cancelled() {
            while batch.len() < max_batch {
                match self.rx.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }
        }

        let depth = self
            .depth
            .fetch_sub(batch.len(), Ordering::Relaxed)
            .saturating_sub(batch.len());
        QUEUE_DEPTH.set(depth as i64);
        debug!(size = batch.len(), depth, "Collected batch");
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedSender;

    struct CollectingSink {
        batches: UnboundedSender<Vec<String>>,
    }

    #[async_trait]
    impl BatchSink for CollectingSink {
        async fn process(&self, batch: Vec<RawMessage>) {
            let topics = batch.into_iter().map(|m| m.topic).collect();
            let _ = self.batches.send(topics);
        }
    }

    fn config(max_batch: usize, interval_ms: u64) -> BatcherConfig {
        BatcherConfig {
            max_batch,
            interval: Duration::from_millis(interval_ms),
            poll_interval: Duration::from_millis(2),
            warn_depth: 500,
        }
    }

    fn message(n: usize) -> RawMessage {
        RawMessage::new(format!("peoplecounter/{}", n), Bytes::from_static(b"[]"))
    }

    #[tokio::test]
    async fn test_full_batches_are_emitted_in_order() {
        let (handle, batcher) = channel(config(100, 50));
        for n in 0..250 {
            handle.enqueue(message(n));
        }
        assert_eq!(handle.depth(), 250);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(batcher.run(Arc::new(CollectingSink { batches: tx }), shutdown.clone()));

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        while seen.len() < 250 {
            let batch = rx.recv().await.unwrap();
            sizes.push(batch.len());
            seen.extend(batch);
        }
        shutdown.cancel();
        let summary = task.await.unwrap();

        assert_eq!(sizes, vec![100, 100, 50]);
        let expected: Vec<String> = (0..250).map(|n| format!("peoplecounter/{}", n)).collect();
        assert_eq!(seen, expected);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.dropped, 0);
        assert_eq!(handle.depth(), 0);
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let (handle, batcher) = channel(config(100, 30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(batcher.run(Arc::new(CollectingSink { batches: tx }), shutdown.clone()));

        for n in 0..3 {
            handle.enqueue(message(n));
        }
        let batch = rx.recv().await.unwrap();

        assert_eq!(batch.len(), 3);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_messages() {
        let (handle, batcher) = channel(config(100, 30));
        for n in 0..5 {
            handle.enqueue(message(n));
        }
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = batcher.run(Arc::new(CollectingSink { batches: tx }), shutdown).await;

        assert_eq!(summary.batches, 0);
        assert_eq!(summary.dropped, 5);
        assert!(rx.try_recv().is_err());

        // Enqueue after close is silently dropped.
        handle.enqueue(message(6));
        assert_eq!(handle.depth(), 0);
    }

    #[test]
    fn test_depth_warning_is_rate_limited() {
        let crossings: Vec<usize> = (1..=1600).filter(|d| crosses_warning(*d, 500)).collect();

        assert_eq!(crossings, vec![501, 1001, 1501]);
    }
}

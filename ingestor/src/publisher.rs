//! Live fan-out of device states and building summaries to viewer groups.

use crate::errors::{Error, Result};
use crate::metrics::FANOUT_FAILURES_TOTAL;
use crate::model::{BuildingSummary, LogicalOccupancy};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DASHBOARD_GROUP: &str = "dashboard";

pub fn building_group(building: &str) -> String {
    format!("building:{}", building)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LiveEvent {
    SensorUpdated(LogicalOccupancy),
    BuildingSummaryUpdated(Vec<BuildingSummary>),
    DeviceReset {
        device_id: String,
        building: String,
    },
    BuildingReset {
        building: String,
        succeeded: usize,
        failed: usize,
    },
}

/// Publish-by-group delivery channel. Membership is the channel's business.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn publish(&self, group: &str, event: Arc<LiveEvent>) -> Result<()>;
}

/// In-process group hub backed by one broadcast channel per group.
pub struct Hub {
    groups: RwLock<HashMap<String, broadcast::Sender<Arc<LiveEvent>>>>,
    capacity: usize,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn join(&self, group: &str) -> broadcast::Receiver<Arc<LiveEvent>> {
        let mut groups = self.groups.write();
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, group: &str) -> usize {
        self.groups
            .read()
            .get(group)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl LiveChannel for Hub {
    async fn publish(&self, group: &str, event: Arc<LiveEvent>) -> Result<()> {
        let sender = self.groups.read().get(group).cloned();
        let Some(sender) = sender else {
            return Ok(());
        };
        // A send error only means nobody is listening right now.
        if sender.send(event).is_err() {
            let mut groups = self.groups.write();
            if groups.get(group).is_some_and(|tx| tx.receiver_count() == 0) {
                groups.remove(group);
                debug!(group, "Dropped empty live group");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: bool,
}

pub struct LivePublisher {
    channel: Arc<dyn LiveChannel>,
    deadline: Duration,
}

impl LivePublisher {
    pub fn new(channel: Arc<dyn LiveChannel>, deadline: Duration) -> Self {
        Self { channel, deadline }
    }

    /// One `SensorUpdated` per device to its building group, plus the summary
    /// list to the dashboard.
    pub async fn publish_batch(
        &self,
        updates: &[LogicalOccupancy],
        summaries: &[BuildingSummary],
    ) -> FanOutReport {
        let mut messages: Vec<(String, LiveEvent)> = updates
            .iter()
            .map(|u| (building_group(&u.location), LiveEvent::SensorUpdated(u.clone())))
            .collect();
        messages.push(summary_message(summaries));
        self.fan_out(messages).await
    }

    pub async fn publish_device_reset(
        &self,
        device_id: &str,
        building: &str,
        summaries: &[BuildingSummary],
    ) -> FanOutReport {
        let reset = LiveEvent::DeviceReset {
            device_id: device_id.to_string(),
            building: building.to_string(),
        };
        self.fan_out(vec![(building_group(building), reset), summary_message(summaries)])
            .await
    }

    pub async fn publish_building_reset(
        &self,
        building: &str,
        succeeded: usize,
        failed: usize,
        summaries: &[BuildingSummary],
    ) -> FanOutReport {
        let reset = LiveEvent::BuildingReset {
            building: building.to_string(),
            succeeded,
            failed,
        };
        self.fan_out(vec![(building_group(building), reset), summary_message(summaries)])
            .await
    }

    /// Publishes every message concurrently and waits for them up to the
    /// deadline. Stragglers keep running detached; nothing is retried.
    async fn fan_out(&self, messages: Vec<(String, LiveEvent)>) -> FanOutReport {
        let mut report = FanOutReport {
            attempted: messages.len(),
            ..Default::default()
        };

        let mut pending: FuturesUnordered<_> = messages
            .into_iter()
            .map(|(group, event)| {
                let channel = self.channel.clone();
                tokio::spawn(async move {
                    channel
                        .publish(&group, Arc::new(event))
                        .await
                        .map_err(|e| match e {
                            Error::Publish { .. } => e,
                            other => Error::Publish {
                                group: group.clone(),
                                reason: other.to_string(),
                            },
                        })
                })
            })
            .collect();

        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(Ok(Ok(()))) => report.delivered += 1,
                    Some(Ok(Err(e))) => {
                        report.failed += 1;
                        warn!(error = %e, "Live publish failed");
                    }
                    Some(Err(e)) => {
                        report.failed += 1;
                        warn!(error = %e, "Live publish task aborted");
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    report.timed_out = true;
                    report.failed += pending.len();
                    warn!(
                        outstanding = pending.len(),
                        deadline_ms = self.deadline.as_millis() as u64,
                        "Live fan-out deadline expired"
                    );
                    break;
                }
            }
        }

        if report.failed > 0 {
            FANOUT_FAILURES_TOTAL.inc_by(report.failed as u64);
        }
        report
    }
}

fn summary_message(summaries: &[BuildingSummary]) -> (String, LiveEvent) {
    (
        DASHBOARD_GROUP.to_string(),
        LiveEvent::BuildingSummaryUpdated(summaries.to_vec()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    fn occupancy(device: &str, building: &str) -> LogicalOccupancy {
        LogicalOccupancy {
            device_id: device.to_string(),
            location: building.to_string(),
            sub_location: String::new(),
            capacity: 30,
            event_time: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            logical_in: 12,
            logical_out: 4,
            occupancy: 8,
        }
    }

    fn summary(building: &str) -> BuildingSummary {
        BuildingSummary {
            building: building.to_string(),
            total_in: 12,
            total_out: 4,
            total_capacity: 30,
        }
    }

    /// Records delivered groups, fails or stalls the configured ones.
    #[derive(Default)]
    struct ScriptedChannel {
        failing: Vec<String>,
        stalled: Vec<String>,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LiveChannel for ScriptedChannel {
        async fn publish(&self, group: &str, _event: Arc<LiveEvent>) -> Result<()> {
            if self.stalled.iter().any(|g| g == group) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing.iter().any(|g| g == group) {
                return Err(Error::Publish {
                    group: group.to_string(),
                    reason: "viewer connection reset".to_string(),
                });
            }
            self.delivered.lock().push(group.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hub_routes_events_by_group() {
        let hub = Arc::new(Hub::new(16));
        let mut hq = hub.join("building:HQ");
        let mut annex = hub.join("building:Annex");
        let mut dashboard = hub.join(DASHBOARD_GROUP);
        let publisher = LivePublisher::new(hub.clone(), Duration::from_secs(1));

        let report = publisher
            .publish_batch(&[occupancy("pc-01", "HQ")], &[summary("HQ")])
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
        match hq.recv().await.unwrap().as_ref() {
            LiveEvent::SensorUpdated(update) => assert_eq!(update.device_id, "pc-01"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            dashboard.recv().await.unwrap().as_ref(),
            LiveEvent::BuildingSummaryUpdated(s) if s.len() == 1
        ));
        assert!(annex.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_viewers_is_not_a_failure() {
        let hub = Arc::new(Hub::new(4));
        drop(hub.join("building:HQ"));
        let publisher = LivePublisher::new(hub.clone(), Duration::from_secs(1));

        let report = publisher
            .publish_batch(&[occupancy("pc-01", "HQ")], &[summary("HQ")])
            .await;

        assert_eq!(report.failed, 0);
        assert_eq!(hub.subscriber_count("building:HQ"), 0);
    }

    #[tokio::test]
    async fn test_one_failing_group_does_not_block_others() {
        let channel = Arc::new(ScriptedChannel {
            failing: vec!["building:Annex".to_string()],
            ..Default::default()
        });
        let publisher = LivePublisher::new(channel.clone(), Duration::from_secs(1));

        let report = publisher
            .publish_batch(
                &[occupancy("pc-01", "HQ"), occupancy("pc-09", "Annex")],
                &[summary("HQ"), summary("Annex")],
            )
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        let mut delivered = channel.delivered.lock().clone();
        delivered.sort();
        assert_eq!(delivered, vec!["building:HQ".to_string(), "dashboard".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_wait() {
        let channel = Arc::new(ScriptedChannel {
            stalled: vec!["dashboard".to_string()],
            ..Default::default()
        });
        let publisher = LivePublisher::new(channel, Duration::from_millis(50));

        let report = publisher
            .publish_device_reset("pc-01", "HQ", &[summary("HQ")])
            .await;

        assert!(report.timed_out);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = LiveEvent::DeviceReset {
            device_id: "pc-01".to_string(),
            building: "HQ".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "event": "DeviceReset",
                "data": { "device_id": "pc-01", "building": "HQ" }
            })
        );
    }
}

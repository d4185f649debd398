//! Turns raw cumulative counters plus the reset log into logical values.

use crate::model::{BuildingSummary, DeviceState, LogicalOccupancy, ResetRecord, TelemetrySample};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Subtracts a reset snapshot from a raw counter. A raw value below the
/// snapshot means the counter has not caught up with it, and the raw value is
/// reported unadjusted.
fn adjust(raw: i64, snapshot: Option<i64>) -> i64 {
    match snapshot {
        None => raw,
        Some(snapshot) if raw < snapshot => raw,
        Some(snapshot) => raw - snapshot,
    }
}

pub fn adjust_counts(raw_in: i64, raw_out: i64, reset: Option<&ResetRecord>) -> (i64, i64) {
    (
        adjust(raw_in, reset.map(|r| r.reset_in_count)),
        adjust(raw_out, reset.map(|r| r.reset_out_count)),
    )
}

/// Logical `(in, out)` counters of a sample under the given reset.
pub fn logical_counts(sample: &TelemetrySample, reset: Option<&ResetRecord>) -> (i64, i64) {
    adjust_counts(sample.in_count, sample.out_count, reset)
}

pub fn resolve(sample: &TelemetrySample, reset: Option<&ResetRecord>) -> LogicalOccupancy {
    let (logical_in, logical_out) = logical_counts(sample, reset);
    LogicalOccupancy {
        device_id: sample.device_id.clone(),
        location: sample.location.clone(),
        sub_location: sample.sub_location.clone(),
        capacity: sample.capacity,
        event_time: sample.event_time,
        logical_in,
        logical_out,
        occupancy: (logical_in - logical_out).max(0),
    }
}

pub fn resolve_state(state: &DeviceState) -> LogicalOccupancy {
    resolve(&state.sample, state.reset.as_ref())
}

/// Index into `resets` (sorted by `reset_time`) of the latest reset taking
/// effect at or before `at`.
pub fn applicable_reset_index(resets: &[&ResetRecord], at: DateTime<Utc>) -> Option<usize> {
    resets
        .partition_point(|r| r.reset_time <= at)
        .checked_sub(1)
}

/// Sums each device's latest logical values per building, sorted by building.
pub fn summarize(devices: &[LogicalOccupancy]) -> Vec<BuildingSummary> {
    let mut buildings: BTreeMap<&str, BuildingSummary> = BTreeMap::new();
    for device in devices {
        let summary = buildings
            .entry(device.location.as_str())
            .or_insert_with(|| BuildingSummary {
                building: device.location.clone(),
                total_in: 0,
                total_out: 0,
                total_capacity: 0,
            });
        summary.total_in += device.logical_in;
        summary.total_out += device.logical_out;
        summary.total_capacity += device.capacity;
    }
    buildings.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn sample(device: &str, location: &str, in_count: i64, out_count: i64) -> TelemetrySample {
        TelemetrySample {
            id: 1,
            device_id: device.to_string(),
            location: location.to_string(),
            sub_location: "Main door".to_string(),
            in_count,
            out_count,
            capacity: 40,
            event_time: at(9),
        }
    }

    fn reset(in_count: i64, out_count: i64, time: DateTime<Utc>) -> ResetRecord {
        ResetRecord {
            device_id: "pc-01".to_string(),
            reset_time: time,
            reset_in_count: in_count,
            reset_out_count: out_count,
        }
    }

    #[test]
    fn test_no_reset_reports_raw() {
        let logical = resolve(&sample("pc-01", "HQ", 57, 20), None);

        assert_eq!(logical.logical_in, 57);
        assert_eq!(logical.logical_out, 20);
        assert_eq!(logical.occupancy, 37);
    }

    #[test]
    fn test_reset_is_subtracted() {
        let r = reset(100, 90, at(8));
        let logical = resolve(&sample("pc-01", "HQ", 130, 95), Some(&r));

        assert_eq!(logical.logical_in, 30);
        assert_eq!(logical.logical_out, 5);
        assert_eq!(logical.occupancy, 25);
    }

    #[test]
    fn test_raw_below_snapshot_keeps_raw() {
        let r = reset(100, 10, at(8));
        let logical = resolve(&sample("pc-01", "HQ", 7, 12), Some(&r));

        // Floor rule: raw 7 < snapshot 100 reports 7, not -93 or 0.
        assert_eq!(logical.logical_in, 7);
        assert_eq!(logical.logical_out, 2);
        assert_eq!(logical.occupancy, 5);
    }

    #[test]
    fn test_occupancy_never_negative() {
        let cases = [
            (0, 0, None),
            (3, 9, None),
            (120, 80, Some(reset(100, 0, at(8)))),
            (50, 500, Some(reset(60, 400, at(8)))),
            (0, 1, Some(reset(5, 0, at(8)))),
        ];
        for (in_count, out_count, r) in cases {
            let logical = resolve(&sample("pc-01", "HQ", in_count, out_count), r.as_ref());
            assert!(logical.occupancy >= 0, "in={} out={}", in_count, out_count);
        }
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let state = DeviceState {
            sample: sample("pc-01", "HQ", 130, 95),
            reset: Some(reset(100, 90, at(8))),
        };

        assert_eq!(resolve_state(&state), resolve_state(&state));
    }

    #[test]
    fn test_applicable_reset_is_latest_not_after_sample() {
        let early = reset(10, 10, at(6));
        let exact = reset(20, 20, at(8));
        let late = reset(30, 30, at(10));
        let resets = vec![&early, &exact, &late];

        assert_eq!(applicable_reset_index(&resets, at(5)), None);
        assert_eq!(applicable_reset_index(&resets, at(7)), Some(0));
        assert_eq!(applicable_reset_index(&resets, at(8)), Some(1));
        assert_eq!(
            applicable_reset_index(&resets, at(9) + Duration::minutes(59)),
            Some(1)
        );
        assert_eq!(applicable_reset_index(&resets, at(11)), Some(2));
    }

    #[test]
    fn test_summary_groups_by_building() {
        let devices = vec![
            resolve(&sample("pc-01", "HQ", 10, 4), None),
            resolve(&sample("pc-02", "HQ", 5, 1), None),
            resolve(&sample("pc-03", "Annex", 8, 8), None),
        ];

        let summaries = summarize(&devices);

        assert_eq!(
            summaries,
            vec![
                BuildingSummary {
                    building: "Annex".to_string(),
                    total_in: 8,
                    total_out: 8,
                    total_capacity: 40,
                },
                BuildingSummary {
                    building: "HQ".to_string(),
                    total_in: 15,
                    total_out: 5,
                    total_capacity: 80,
                },
            ]
        );
    }
}

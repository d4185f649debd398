//! Time-bucketed flow aggregation over cumulative counters.
//!
//! Counters are cumulative, so the latest (maximum) reading of a bucket is
//! its value and the flow of a bucket is the difference to the previous
//! bucket. Resets and raw-counter decreases split the readings into
//! segments; differences are never taken across a segment boundary. The
//! first bucket of a segment is differenced against the segment's origin:
//! zero after a reset for logical values, otherwise the reading the counter
//! restarted from.

use crate::errors::{Error, Result};
use crate::model::{ChartPoint, ResetRecord, TelemetrySample, TrendPoint, TrendWindow};
use crate::resolver::{adjust_counts, applicable_reset_index, logical_counts};
use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Hour,
    Day,
    Month,
}

impl Bucket {
    pub fn start_of(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = |date: chrono::NaiveDate| date.and_time(NaiveTime::MIN).and_utc();
        match self {
            Bucket::Hour => midnight(t.date_naive()) + Duration::hours(i64::from(t.hour())),
            Bucket::Day => midnight(t.date_naive()),
            Bucket::Month => midnight(t.date_naive() - Days::new(u64::from(t.day0()))),
        }
    }

    /// Start of the bucket following the one containing `t`.
    pub fn next_start(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.start_of(t);
        match self {
            Bucket::Hour => start + Duration::hours(1),
            Bucket::Day => start + Duration::days(1),
            Bucket::Month => (start.date_naive() + Months::new(1))
                .and_time(NaiveTime::MIN)
                .and_utc(),
        }
    }

    /// Widens `[from, to]` to whole buckets, returned as a half-open range.
    pub fn widen(self, from: DateTime<Utc>, to: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start_of(from), self.next_start(to))
    }
}

impl FromStr for Bucket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Bucket::Hour),
            "day" => Ok(Bucket::Day),
            "month" => Ok(Bucket::Month),
            _ => Err(Error::InvalidBucket(s.to_string())),
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Bucket::Hour => "hour",
            Bucket::Day => "day",
            Bucket::Month => "month",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counters {
    /// Reset-adjusted values; a new segment counts up from zero.
    Logical,
    /// Raw hardware values; a new segment starts at its opening reading.
    Raw,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    at: DateTime<Utc>,
    segment: u32,
    origin: (i64, i64),
    count_in: i64,
    count_out: i64,
}

#[derive(Debug, Clone, Copy)]
struct SegmentBucket {
    segment: u32,
    start: DateTime<Utc>,
    origin: (i64, i64),
    max_in: i64,
    max_out: i64,
}

/// Builds the ordered, segmented readings of one device. `samples` and
/// `resets` must be sorted by time.
fn readings(samples: &[&TelemetrySample], resets: &[&ResetRecord], counters: Counters) -> Vec<Reading> {
    let mut out = Vec::with_capacity(samples.len());
    let mut segment = 0u32;
    let mut origin = (0, 0);
    let mut last: Option<(Option<usize>, i64, i64)> = None;

    for sample in samples {
        let index = applicable_reset_index(resets, sample.event_time);
        let reset = index.map(|i| resets[i]);
        let (count_in, count_out) = match counters {
            Counters::Logical => logical_counts(sample, reset),
            Counters::Raw => (sample.in_count, sample.out_count),
        };

        match last {
            None => origin = (count_in, count_out),
            Some((last_index, last_in, last_out)) if last_index != index => {
                // The first reset after the previous reading carries the
                // counters at the moment the old segment was closed.
                if let Some(closing) = resets.get(last_index.map_or(0, |i| i + 1)) {
                    let (close_in, close_out) = match counters {
                        Counters::Logical => adjust_counts(
                            closing.reset_in_count,
                            closing.reset_out_count,
                            last_index.map(|i| resets[i]),
                        ),
                        Counters::Raw => (closing.reset_in_count, closing.reset_out_count),
                    };
                    if close_in >= last_in && close_out >= last_out {
                        out.push(Reading {
                            at: closing.reset_time,
                            segment,
                            origin,
                            count_in: close_in,
                            count_out: close_out,
                        });
                    }
                }
                segment += 1;
                origin = match counters {
                    Counters::Logical => (0, 0),
                    Counters::Raw => (count_in, count_out),
                };
            }
            Some((_, last_in, last_out)) if count_in < last_in || count_out < last_out => {
                // Counter went backwards without a reset: power-cycle or
                // glitch. Only a counter that dropped restarts from its new
                // reading; the other carries on from where it was.
                segment += 1;
                origin = (count_in.min(last_in), count_out.min(last_out));
            }
            Some(_) => {}
        }

        out.push(Reading {
            at: sample.event_time,
            segment,
            origin,
            count_in,
            count_out,
        });
        last = Some((index, count_in, count_out));
    }
    out
}

fn bucketize(readings: &[Reading], bucket: Bucket) -> Vec<SegmentBucket> {
    let mut out: Vec<SegmentBucket> = Vec::new();
    for reading in readings {
        let start = bucket.start_of(reading.at);
        match out.last_mut() {
            Some(last) if last.segment == reading.segment && last.start == start => {
                last.max_in = last.max_in.max(reading.count_in);
                last.max_out = last.max_out.max(reading.count_out);
            }
            _ => out.push(SegmentBucket {
                segment: reading.segment,
                start,
                origin: reading.origin,
                max_in: reading.count_in,
                max_out: reading.count_out,
            }),
        }
    }
    out
}

/// Per-bucket flow within each segment, in time order.
fn lagged(buckets: &[SegmentBucket]) -> Vec<(SegmentBucket, i64, i64)> {
    let mut out = Vec::with_capacity(buckets.len());
    let mut prev: Option<&SegmentBucket> = None;
    for current in buckets {
        let (base_in, base_out) = match prev {
            Some(p) if p.segment == current.segment => (p.max_in, p.max_out),
            _ => current.origin,
        };
        out.push((*current, current.max_in - base_in, current.max_out - base_out));
        prev = Some(current);
    }
    out
}

/// Flow per bucket for every device in the window, summed per bucket. Each
/// device is differenced on its own before summation.
pub fn trend(window: &TrendWindow, bucket: Bucket) -> Vec<TrendPoint> {
    let mut totals = BTreeMap::new();
    for (samples, resets) in split_by_device(window).values() {
        accumulate(&mut totals, samples, resets, bucket);
    }
    into_points(totals)
}

/// Raw counters of each device bucketed per segment, segments concatenated
/// in time order.
pub fn segment_chart(window: &TrendWindow, bucket: Bucket) -> Vec<ChartPoint> {
    let mut points = Vec::new();
    for (samples, resets) in split_by_device(window).values() {
        let readings = readings(samples, resets, Counters::Raw);
        let buckets = bucketize(&readings, bucket);
        points.extend(
            lagged(&buckets)
                .into_iter()
                .map(|(b, delta_in, delta_out)| ChartPoint {
                    segment_id: b.segment,
                    bucket_start: b.start,
                    total_in: b.max_in,
                    total_out: b.max_out,
                    delta_in,
                    delta_out,
                }),
        );
    }
    points.sort_by_key(|p| p.bucket_start);
    points
}

fn accumulate(
    totals: &mut BTreeMap<DateTime<Utc>, (i64, i64)>,
    samples: &[&TelemetrySample],
    resets: &[&ResetRecord],
    bucket: Bucket,
) {
    let readings = readings(samples, resets, Counters::Logical);
    for (b, delta_in, delta_out) in lagged(&bucketize(&readings, bucket)) {
        let entry = totals.entry(b.start).or_insert((0, 0));
        entry.0 += delta_in;
        entry.1 += delta_out;
    }
}

fn into_points(totals: BTreeMap<DateTime<Utc>, (i64, i64)>) -> Vec<TrendPoint> {
    totals
        .into_iter()
        .map(|(bucket_start, (delta_in, delta_out))| TrendPoint {
            bucket_start,
            delta_in,
            delta_out,
        })
        .collect()
}

type DeviceSeries<'a> = (Vec<&'a TelemetrySample>, Vec<&'a ResetRecord>);

fn split_by_device(window: &TrendWindow) -> BTreeMap<&str, DeviceSeries<'_>> {
    let mut devices: BTreeMap<&str, DeviceSeries<'_>> = BTreeMap::new();
    for sample in &window.samples {
        devices.entry(sample.device_id.as_str()).or_default().0.push(sample);
    }
    for reset in &window.resets {
        if let Some(series) = devices.get_mut(reset.device_id.as_str()) {
            series.1.push(reset);
        }
    }
    for (samples, resets) in devices.values_mut() {
        samples.sort_by_key(|s| (s.event_time, s.id));
        resets.sort_by_key(|r| r.reset_time);
    }
    devices
}

use crate::errors::{Error, Result};
use crate::model::{CounterReading, DevicePayload, TelemetrySample};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::warn;

/// Naive layouts accepted besides RFC 3339. Naive times are taken as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Many(Vec<DevicePayload>),
    One(DevicePayload),
}

/// Samples decoded from one transport payload.
#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub samples: Vec<TelemetrySample>,
    /// Readings dropped for a bad timestamp or out-of-range values.
    pub skipped: usize,
}

/// Decodes a payload into samples. A payload that is not valid JSON fails as
/// a whole; individual bad readings are skipped and counted.
pub fn parse_payload(payload: &[u8]) -> Result<ParsedMessage> {
    let devices = match serde_json::from_slice::<Envelope>(payload)? {
        Envelope::Many(devices) => devices,
        Envelope::One(device) => vec![device],
    };

    let mut parsed = ParsedMessage::default();
    for device in devices {
        for reading in &device.data {
            match to_sample(&device.device, reading) {
                Ok(sample) => parsed.samples.push(sample),
                Err(e) => {
                    warn!("Skipping reading for device '{}': {}", device.device, e);
                    parsed.skipped += 1;
                }
            }
        }
    }
    Ok(parsed)
}

fn to_sample(device_id: &str, reading: &CounterReading) -> Result<TelemetrySample> {
    let sample = TelemetrySample {
        id: 0,
        device_id: device_id.trim().to_string(),
        location: reading.location.trim().to_string(),
        sub_location: reading
            .sub_location
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string(),
        in_count: reading.total_in,
        out_count: reading.total_out,
        capacity: reading.capacity,
        event_time: parse_timestamp(&reading.timestamp)?,
    };
    validate(&sample)?;
    Ok(sample)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::Validation(format!("Invalid timestamp '{}'", raw)))
}

/// Validates a decoded sample
pub fn validate(sample: &TelemetrySample) -> Result<()> {
    if sample.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if sample.location.is_empty() {
        return Err(Error::Validation("Location cannot be empty".to_string()));
    }

    if sample.in_count < 0 || sample.out_count < 0 {
        return Err(Error::Validation(format!(
            "Counters must be non-negative, got in={} out={}",
            sample.in_count, sample.out_count
        )));
    }

    if sample.capacity < 0 {
        return Err(Error::Validation(format!(
            "Capacity {} must be non-negative",
            sample.capacity
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(timestamp: &str, total_in: i64) -> String {
        format!(
            r#"[{{"Device":"pc-01","Data":[{{"Location":"HQ","SubLocation":"Lobby","Total_IN":{},"Total_Out":3,"Capacity":50,"ipaddr":"10.0.0.7","TimeStamp":"{}"}}]}}]"#,
            total_in, timestamp
        )
    }

    #[test]
    fn test_parse_valid_payload() {
        let parsed = parse_payload(payload("2026-03-01 08:15:00", 12).as_bytes()).unwrap();

        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.samples.len(), 1);
        let sample = &parsed.samples[0];
        assert_eq!(sample.device_id, "pc-01");
        assert_eq!(sample.location, "HQ");
        assert_eq!(sample.sub_location, "Lobby");
        assert_eq!(sample.in_count, 12);
        assert_eq!(sample.out_count, 3);
        assert_eq!(sample.capacity, 50);
        assert_eq!(
            sample.event_time,
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_single_object_payload() {
        let body = r#"{"Device":"pc-02","Data":[{"Location":"Annex","Total_IN":1,"Total_Out":0,"TimeStamp":"2026-03-01T08:00:00Z"}]}"#;
        let parsed = parse_payload(body.as_bytes()).unwrap();

        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.samples[0].sub_location, "");
    }

    #[test]
    fn test_bad_timestamp_is_skipped() {
        let parsed = parse_payload(payload("yesterday-ish", 12).as_bytes()).unwrap();

        assert!(parsed.samples.is_empty());
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_invalid_json() {
        assert!(parse_payload(b"invalid json").is_err());
    }

    #[test]
    fn test_negative_counter_is_skipped() {
        let parsed = parse_payload(payload("2026-03-01 08:15:00", -4).as_bytes()).unwrap();

        assert!(parsed.samples.is_empty());
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 8, 15, 0).unwrap();

        assert_eq!(parse_timestamp("2026-03-01T08:15:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-01T10:15:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-01T08:15:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2026/03/01 08:15:00").unwrap(), expected);
        assert_eq!(parse_timestamp("01/03/2026 08:15:00").unwrap(), expected);
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let sample = TelemetrySample {
            id: 0,
            device_id: "".to_string(),
            location: "HQ".to_string(),
            sub_location: String::new(),
            in_count: 1,
            out_count: 0,
            capacity: 10,
            event_time: Utc::now(),
        };

        assert!(validate(&sample).is_err());
    }
}

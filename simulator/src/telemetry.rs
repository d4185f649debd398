use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// One device entry of a people-counter payload.
#[derive(Debug, Clone, Serialize)]
pub struct DevicePayload {
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "Data")]
    pub data: Vec<CounterReading>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterReading {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "SubLocation")]
    pub sub_location: String,
    #[serde(rename = "Total_IN")]
    pub total_in: i64,
    #[serde(rename = "Total_Out")]
    pub total_out: i64,
    #[serde(rename = "Capacity")]
    pub capacity: i64,
    pub ipaddr: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: String,
}

/// A simulated door sensor with cumulative counters.
#[derive(Debug, Clone)]
pub struct Door {
    pub device_id: String,
    pub building: String,
    pub entrance: String,
    pub capacity: i64,
    pub ipaddr: String,
    pub total_in: i64,
    pub total_out: i64,
}

impl Door {
    pub fn new(index: usize, buildings: usize) -> Self {
        Self {
            device_id: format!("pc-{:04}", index),
            building: format!("Building-{}", (b'A' + (index % buildings.clamp(1, 26)) as u8) as char),
            entrance: format!("Entrance {}", index % 4 + 1),
            capacity: 50 + (index as i64 % 5) * 25,
            ipaddr: format!("10.0.{}.{}", index / 250, index % 250 + 1),
            total_in: 0,
            total_out: 0,
        }
    }

    /// Advances the counters and renders a reading. With probability
    /// `bad_timestamp_ratio` the timestamp is garbage.
    pub fn step(&mut self, rng: &mut impl Rng, now: DateTime<Utc>, bad_timestamp_ratio: f64) -> DevicePayload {
        let occupancy = self.total_in - self.total_out;
        let arrivals = rng.gen_range(0..4);
        let departures = rng.gen_range(0..4).min(occupancy + arrivals);
        self.total_in += arrivals;
        self.total_out += departures;

        let timestamp = if rng.gen_bool(bad_timestamp_ratio.clamp(0.0, 1.0)) {
            "not-a-timestamp".to_string()
        } else {
            now.format("%Y-%m-%dT%H:%M:%S").to_string()
        };

        DevicePayload {
            device: self.device_id.clone(),
            data: vec![CounterReading {
                location: self.building.clone(),
                sub_location: self.entrance.clone(),
                total_in: self.total_in,
                total_out: self.total_out,
                capacity: self.capacity,
                ipaddr: self.ipaddr.clone(),
                timestamp,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_cumulative_and_never_leave_more_than_entered() {
        let mut rng = rand::thread_rng();
        let mut door = Door::new(7, 3);
        let mut last = (0, 0);

        for _ in 0..500 {
            let payload = door.step(&mut rng, Utc::now(), 0.0);
            let reading = &payload.data[0];
            assert!(reading.total_in >= last.0);
            assert!(reading.total_out >= last.1);
            assert!(reading.total_out <= reading.total_in);
            last = (reading.total_in, reading.total_out);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let mut rng = rand::thread_rng();
        let payload = Door::new(0, 1).step(&mut rng, Utc::now(), 1.0);

        let json = serde_json::to_value(vec![payload]).unwrap();

        assert_eq!(json[0]["Device"], "pc-0000");
        assert_eq!(json[0]["Data"][0]["Location"], "Building-A");
        assert_eq!(json[0]["Data"][0]["TimeStamp"], "not-a-timestamp");
        assert!(json[0]["Data"][0].get("Total_IN").is_some());
    }
}

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// One year; longer periods would overflow timer deadlines.
const MAX_RETENTION_SWEEP_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_prefix: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub mqtt: MqttSettings,
    pub http_addr: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub batch_poll: Duration,
    pub queue_warning_threshold: usize,
    pub fanout_deadline: Duration,
    pub live_channel_capacity: usize,
    pub offline_after: Duration,
    pub liveness_sweep: Duration,
    /// Months of samples kept live; 0 disables archival.
    pub retention_months: u32,
    pub retention_sweep: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            database_url: optional("DATABASE_URL"),
            mqtt: MqttSettings {
                broker: text("MQTT_BROKER", "localhost"),
                port: parsed(&lookup, "MQTT_PORT", 1883),
                topic: text("MQTT_TOPIC", "peoplecounter/#"),
                username: optional("MQTT_USERNAME"),
                password: optional("MQTT_PASSWORD"),
                client_prefix: text("MQTT_CLIENT_PREFIX", "occupancy-"),
            },
            http_addr: text("HTTP_ADDR", "0.0.0.0:8080"),
            batch_size: parsed(&lookup, "BATCH_SIZE", 100usize).max(1),
            batch_interval: Duration::from_millis(parsed(&lookup, "BATCH_INTERVAL_MS", 200)),
            batch_poll: Duration::from_millis(parsed(&lookup, "BATCH_POLL_MS", 10u64).max(1)),
            queue_warning_threshold: parsed(&lookup, "QUEUE_WARNING_THRESHOLD", 500usize).max(1),
            fanout_deadline: Duration::from_millis(parsed(&lookup, "FANOUT_DEADLINE_MS", 2000)),
            live_channel_capacity: parsed(&lookup, "LIVE_CHANNEL_CAPACITY", 256usize).max(1),
            offline_after: Duration::from_secs(parsed(&lookup, "OFFLINE_AFTER_SECS", 300)),
            liveness_sweep: Duration::from_secs(parsed(&lookup, "LIVENESS_SWEEP_SECS", 120u64).max(1)),
            retention_months: parsed(&lookup, "RETENTION_MONTHS", 1),
            retention_sweep: Duration::from_secs(
                parsed(&lookup, "RETENTION_SWEEP_HOURS", 24u64)
                    .clamp(1, MAX_RETENTION_SWEEP_HOURS)
                    * 3600,
            ),
        }
    }
}

/// Parses a variable, falling back to the default when unset or malformed.
fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert!(config.database_url.is_none());
        assert_eq!(config.mqtt.topic, "peoplecounter/#");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_interval, Duration::from_millis(200));
        assert_eq!(config.batch_poll, Duration::from_millis(10));
        assert_eq!(config.queue_warning_threshold, 500);
        assert_eq!(config.retention_months, 1);
        assert_eq!(config.retention_sweep, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_overrides_and_malformed_fallback() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://occ:pass@db/occupancy"),
            ("BATCH_SIZE", "250"),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USERNAME", "  "),
        ]);

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://occ:pass@db/occupancy")
        );
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.mqtt.username.is_none());
    }

    #[test]
    fn test_huge_retention_sweep_is_capped() {
        let config = config_from(&[("RETENTION_SWEEP_HOURS", "18446744073709551615")]);

        assert_eq!(config.retention_sweep, Duration::from_secs(24 * 365 * 3600));
    }
}

mod telemetry;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::Door;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "occupancy-simulator", about = "Publishes simulated people-counter telemetry")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 200)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 20)]
    devices: usize,

    #[arg(long, env = "BUILDINGS", default_value_t = 3)]
    buildings: usize,

    /// Share of readings sent with an unparseable timestamp.
    #[arg(long, env = "BAD_TIMESTAMP_RATIO", default_value_t = 0.01)]
    bad_timestamp_ratio: f64,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "peoplecounter")]
    topic_prefix: String,
}

const BURST_SIZE: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    anyhow::ensure!(args.devices > 0, "at least one device is required");
    anyhow::ensure!(args.rate > 0, "rate must be positive");

    info!("Starting people-counter simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Buildings: {}",
        args.broker, args.port, args.rate, args.devices, args.buildings
    );

    let client_id = format!("occupancy-sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish counters");

    let mut doors: Vec<Door> = (0..args.devices)
        .map(|i| Door::new(i, args.buildings))
        .collect();
    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / args.rate);

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let door = &mut doors[(counter % args.devices as u64) as usize];
            let reading = door.step(&mut rng, Utc::now(), args.bad_timestamp_ratio);
            let topic = format!("{}/{}", args.topic_prefix, door.device_id);
            let payload = serde_json::to_string(&[reading]).context("serializing payload")?;

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 10_000 < BURST_SIZE as u64 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - broker may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

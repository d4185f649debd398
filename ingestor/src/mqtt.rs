use crate::batching::{IngestHandle, RawMessage};
use crate::config::MqttSettings;
use crate::errors::{Error, Result};
use crate::metrics::MESSAGES_TOTAL;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Subscribes to the counter topic and hands every payload to the ingest
/// queue until cancelled. The event loop reconnects on its own; the
/// subscription is renewed on every ConnAck.
pub async fn run_mqtt(
    settings: MqttSettings,
    client_id: String,
    ingest: IngestHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.broker, settings.port, client_id
    );

    let mut mqtt_options = MqttOptions::new(client_id, settings.broker.clone(), settings.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            notification = eventloop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                client
                    .subscribe(settings.topic.as_str(), QoS::AtLeastOnce)
                    .await
                    .map_err(Error::Mqtt)?;
                info!("Subscribed to {} with QoS 1", settings.topic);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => handle_publish(&ingest, publish),
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        debug!("MQTT disconnect failed: {}", e);
    }
    info!("MQTT loop stopped");
    Ok(())
}

/// Enqueues the raw payload; parsing happens on the batch consumer.
fn handle_publish(ingest: &IngestHandle, publish: Publish) {
    MESSAGES_TOTAL.inc();
    debug!(
        "Received message on topic {}, size: {} bytes",
        publish.topic,
        publish.payload.len()
    );
    ingest.enqueue(RawMessage::new(publish.topic, publish.payload));
}

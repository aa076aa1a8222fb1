use crate::cache::CacheEvent;
use crate::config::KernelConfig;
use crate::health::BusHealth;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};
use unas_core::Topics;

pub fn mqtt_options(cfg: &KernelConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));
    if let (Some(user), Some(pass)) = (&cfg.mqtt.username, &cfg.mqtt.password) {
        opts.set_credentials(user, pass);
    }
    opts
}

/// Everything the cache needs: telemetry, retained curve and mode, liveness.
pub fn subscriptions(topics: &Topics) -> Vec<String> {
    vec![topics.sensor_filter(), topics.fan_curve_filter(), topics.fan_mode(), topics.status()]
}

/// Poll the broker forever and feed the cache writer. Subscriptions are renewed on each
/// ConnAck so retained state is replayed after a broker restart.
pub fn spawn_mqtt_listener(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    events: mpsc::Sender<CacheEvent>,
    health: BusHealth,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("Connected to broker, subscribing under {}", topics.namespace());
                    health.mark_connected();
                    for filter in subscriptions(&topics) {
                        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            error!("Subscribe to {} failed: {}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let payload = String::from_utf8_lossy(&p.payload);
                    let Some(event) = CacheEvent::from_publish(&topics, &p.topic, &payload) else {
                        continue;
                    };
                    debug!("{} = {}", p.topic, payload);
                    if events.send(event).await.is_err() {
                        info!("Cache writer gone, stopping MQTT listener");
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}");
                    health.mark_disconnected();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

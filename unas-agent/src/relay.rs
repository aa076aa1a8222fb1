//! Bus relay: broker connection, inbound control routing, telemetry publishing
//!
//! Each role holds its own connection. Subscriptions are (re)issued on every ConnAck so a
//! broker restart does not leave the agent deaf; retained control messages are delivered
//! again on resubscribe, which is how the fan loop recovers mode and curve after a reconnect.

use crate::config::AgentConfig;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use unas_core::{
    parse_monitor_interval, Bus, CurveParam, FanMode, Inbound, Liveness, TelemetrySample, TelemetryValue, Topics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Monitor,
    FanControl,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::FanControl => "fan-control",
        }
    }

    /// Topic filters this role listens on.
    pub fn subscriptions(&self, topics: &Topics) -> Vec<String> {
        match self {
            Self::Monitor => vec![topics.monitor_interval()],
            Self::FanControl => vec![topics.fan_mode(), topics.fan_curve_filter(), topics.sensor_filter()],
        }
    }
}

/// Decoded inbound control or sensor message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Interval(Duration),
    Mode(FanMode),
    Curve(CurveParam, i64),
    Reading(String, TelemetryValue),
}

pub fn mqtt_options(config: &AgentConfig, role: Role, topics: &Topics) -> MqttOptions {
    let mut opts = MqttOptions::new(config.client_id(role.as_str()), &config.mqtt.host, config.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
    opts.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
        opts.set_credentials(user, pass);
    }
    // the monitor owns liveness: its disconnect is what "offline" means
    if role == Role::Monitor {
        opts.set_last_will(LastWill::new(
            topics.status(),
            Liveness::Offline.as_payload(),
            QoS::AtLeastOnce,
            true,
        ));
    }
    opts
}

/// Decode an inbound publish. Malformed control payloads are dropped here; the consumer
/// keeps its previous value.
pub fn route(topics: &Topics, topic: &str, payload: &str) -> Option<ControlEvent> {
    match topics.classify(topic)? {
        Inbound::MonitorInterval => match parse_monitor_interval(payload) {
            Some(interval) => Some(ControlEvent::Interval(interval)),
            None => {
                warn!("Ignoring monitor_interval '{}' (accepted 5..=60)", payload);
                None
            }
        },
        Inbound::FanMode => match payload.parse::<FanMode>() {
            Ok(mode) => Some(ControlEvent::Mode(mode)),
            Err(e) => {
                warn!("Ignoring fan_mode: {e}");
                None
            }
        },
        Inbound::FanCurve(param) => match payload.trim().parse::<i64>() {
            Ok(value) => Some(ControlEvent::Curve(param, value)),
            Err(_) => {
                warn!("Ignoring non-integer {} payload '{}'", param, payload);
                None
            }
        },
        Inbound::Sensor(key) => Some(ControlEvent::Reading(key.to_string(), TelemetryValue::parse_raw(payload))),
        Inbound::Status => None,
    }
}

/// Drive the rumqttc event loop forever, forwarding decoded events.
pub fn spawn_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    role: Role,
    topics: Topics,
    events: mpsc::Sender<ControlEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("✅ [{}] connected to broker", role.as_str());
                    for filter in role.subscriptions(&topics) {
                        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                            error!("Subscribe to {} failed: {}", filter, e);
                        }
                    }
                    if role == Role::Monitor {
                        if let Err(e) = Bus::publish(&client, &topics.status(), Liveness::Online.as_payload().to_string(), true).await {
                            error!("Failed to publish liveness: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let payload = String::from_utf8_lossy(&p.payload);
                    if let Some(event) = route(&topics, &p.topic, &payload) {
                        debug!("📨 {} -> {:?}", p.topic, event);
                        if events.send(event).await.is_err() {
                            info!("Event consumer gone, stopping {} relay", role.as_str());
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Publish every key of a sample as a retained bare-string state. Returns how many
/// publishes failed; a failure on one key does not stop the others.
pub async fn publish_sample(bus: &dyn Bus, topics: &Topics, sample: &TelemetrySample) -> usize {
    let mut failures = 0;
    for (key, value) in sample {
        if let Err(e) = bus.publish(&topics.sensor_state(key), value.to_string(), true).await {
            debug!("publish {} failed: {}", key, e);
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_devkit::MockBus;

    #[test]
    fn test_route_control_topics() {
        let t = Topics::default();
        assert_eq!(
            route(&t, "homeassistant/unas/fan_mode", "auto"),
            Some(ControlEvent::Mode(FanMode::CustomCurve))
        );
        assert_eq!(
            route(&t, "homeassistant/unas/fan_mode", "128"),
            Some(ControlEvent::Mode(FanMode::FixedSpeed(128)))
        );
        assert_eq!(route(&t, "homeassistant/unas/fan_mode", "blast"), None);
        assert_eq!(
            route(&t, "homeassistant/unas/fan_curve/max_temp", " 50 "),
            Some(ControlEvent::Curve(CurveParam::MaxTemp, 50))
        );
        assert_eq!(route(&t, "homeassistant/unas/fan_curve/max_temp", "50.5"), None);
        assert_eq!(
            route(&t, "homeassistant/unas/monitor_interval", "10"),
            Some(ControlEvent::Interval(Duration::from_secs(10)))
        );
        assert_eq!(route(&t, "homeassistant/unas/monitor_interval", "600"), None);
        assert_eq!(route(&t, "homeassistant/unas/status", "online"), None);
    }

    #[test]
    fn test_route_sensor_readings() {
        let t = Topics::default();
        assert_eq!(
            route(&t, "homeassistant/unas/sensor/hdd_2_temperature/state", "41"),
            Some(ControlEvent::Reading("hdd_2_temperature".into(), TelemetryValue::Int(41)))
        );
    }

    #[test]
    fn test_subscriptions_per_role() {
        let t = Topics::default();
        assert_eq!(Role::Monitor.subscriptions(&t), vec!["homeassistant/unas/monitor_interval"]);
        let fan = Role::FanControl.subscriptions(&t);
        assert!(fan.contains(&"homeassistant/unas/fan_curve/+".to_string()));
        assert!(fan.contains(&"homeassistant/unas/sensor/+/state".to_string()));
    }

    #[test]
    fn test_last_will_only_for_monitor() {
        let config = AgentConfig::default();
        let t = Topics::default();
        let will = mqtt_options(&config, Role::Monitor, &t).last_will().unwrap();
        assert_eq!(will.topic, "homeassistant/unas/status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
        assert!(mqtt_options(&config, Role::FanControl, &t).last_will().is_none());
    }

    #[tokio::test]
    async fn test_publish_sample_retained() {
        let bus = MockBus::new();
        let t = Topics::default();
        let mut sample = TelemetrySample::new();
        sample.insert("cpu_temp".into(), TelemetryValue::Int(51));
        sample.insert("memory_usage".into(), TelemetryValue::Float(40.0));

        assert_eq!(publish_sample(&bus, &t, &sample).await, 0);
        assert_eq!(bus.retained("homeassistant/unas/sensor/cpu_temp/state").as_deref(), Some("51"));
        assert_eq!(bus.retained("homeassistant/unas/sensor/memory_usage/state").as_deref(), Some("40.0"));

        bus.set_connected(false);
        assert_eq!(publish_sample(&bus, &t, &sample).await, 2);
    }
}

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::task;

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::TransitionEvent;
use crate::notifier::{Message, NotifyError, Target, Transport};
use crate::settings::NotifySettings;
use crate::state::Shutdown;

pub const TOPIC_TRANSITION: &str = "pinger/events/transition@v1";
pub const TOPIC_HEALTH: &str = "pinger/kernel/health@v1";
const HEALTH_PUBLISH_EVERY: Duration = Duration::from_secs(30);

fn connect(conf: &MqttConf, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 10)
}

/// Keeps the connection alive; rumqttc only makes progress while polled.
fn spawn_event_loop(mut eventloop: EventLoop, mut shutdown: Shutdown, label: &'static str) {
    task::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = eventloop.poll() => {
                    if let Err(e) = event {
                        tracing::warn!(client = label, error = %e, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });
}

#[derive(Serialize)]
struct TransitionPayload<'a> {
    #[serde(flatten)]
    event: &'a TransitionEvent,
    message: &'a str,
}

/// Publishes every transition as JSON. Enabled by the presence of `mqtt` in
/// the static config, independent of the operator settings.
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn connect(conf: &MqttConf, shutdown: Shutdown) -> Self {
        let (client, eventloop) = connect(conf, "pinger-kernel-events");
        spawn_event_loop(eventloop, shutdown, "events");
        tracing::info!(host = %conf.host, port = conf.port, topic = TOPIC_TRANSITION, "mqtt transport ready");
        Self { client }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn targets(&self, _settings: &NotifySettings) -> Vec<Target> {
        vec![Target::new(TOPIC_TRANSITION)]
    }

    async fn send(&self, target: &Target, message: &Message<'_>) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(&TransitionPayload { event: message.event, message: message.text })?;
        self.client.publish(target.to.as_str(), QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

/// Periodic copy of the `/health` report on the MQTT bus.
pub fn spawn_health_publisher(health: HealthTracker, conf: &MqttConf, mut shutdown: Shutdown) {
    let (client, mut eventloop) = connect(conf, "pinger-kernel-health");
    task::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_PUBLISH_EVERY);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    let report = health.report();
                    match serde_json::to_vec(&report) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(TOPIC_HEALTH, QoS::AtLeastOnce, false, payload).await {
                                tracing::warn!(error = %e, "health publish failed");
                            } else {
                                tracing::debug!(uptime = report.uptime_seconds, status = ?report.status, "health published");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "health report not serializable"),
                    }
                },
                event = eventloop.poll() => {
                    if let Err(e) = event {
                        tracing::warn!(client = "health", error = %e, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, DeviceKind, ProbeKind, Reachability};
    use time::macros::datetime;

    #[test]
    fn payload_flattens_event_and_adds_message() {
        let event = TransitionEvent {
            event_id: uuid::Uuid::nil(),
            device: Device {
                id: "9".into(),
                name: String::new(),
                kind: DeviceKind::Equipment,
                address: "10.9.9.9".into(),
                snmp: None,
                is_mikrotik: true,
            },
            from: Reachability::Up,
            to: Reachability::Down,
            latency_ms: None,
            kind: ProbeKind::IcmpTimeout,
            at: datetime!(2024-01-02 03:04:05 UTC),
        };
        let json = serde_json::to_value(TransitionPayload { event: &event, message: "9 down" }).unwrap();
        assert_eq!(json["to"], "down");
        assert_eq!(json["from"], "up");
        assert_eq!(json["kind"], "icmp_timeout");
        assert_eq!(json["device"]["id"], "9");
        assert_eq!(json["message"], "9 down");
        assert_eq!(json["at"], "2024-01-02T03:04:05Z");
    }
}

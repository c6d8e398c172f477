//! Local MQTT broker leg.
//!
//! A plain MQTT 3.1.1 TCP client (rumqttc) with its own exponential
//! backoff, independent of the cloud side. While the broker is down the
//! bridge keeps applying cloud updates to the state store; snapshots are
//! re-published by the status and poll cycles once the broker returns,
//! so nothing is queued here.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MosquittoConfig;

const BROKER_CHANNEL_CAPACITY: usize = 64;
const BROKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Topic filter for inbound commands.
pub const COMMAND_FILTER: &str = "fossibot/+/command";

#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

pub struct BrokerClient {
    client: AsyncClient,
}

impl BrokerClient {
    /// Connects to the configured broker and spawns its poll task. The
    /// task reconnects forever with the bridge-wide backoff bounds.
    pub fn spawn(
        config: &MosquittoConfig,
        delay_min: Duration,
        delay_max: Duration,
        events: mpsc::UnboundedSender<BrokerEvent>,
        cancellation: CancellationToken,
    ) -> BrokerClient {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(BROKER_KEEP_ALIVE);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, BROKER_CHANNEL_CAPACITY);
        let poll_client = client.clone();
        let host = config.host.clone();
        let port = config.port;

        tokio::spawn(async move {
            let mut delay = delay_min;
            let mut connected = false;
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        log::debug!("Broker poll task stopping");
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to the local broker at {host}:{port}");
                            delay = delay_min;
                            connected = true;
                            if let Err(e) = poll_client
                                .subscribe(COMMAND_FILTER, QoS::AtLeastOnce)
                                .await
                            {
                                log::warn!("Unable to subscribe to {COMMAND_FILTER}: {e}");
                            }
                            let _ = events.send(BrokerEvent::Connected);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let _ = events.send(BrokerEvent::Message {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected {
                                connected = false;
                                let _ = events.send(BrokerEvent::Disconnected);
                            }
                            log::warn!(
                                "Local broker connection failed: {e}; retrying in {}s",
                                delay.as_secs()
                            );
                            tokio::select! {
                                _ = cancellation.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            delay = (delay * 2).min(delay_max);
                        }
                    }
                }
            }
        });

        BrokerClient { client }
    }

    /// Fire-and-forget QoS-1 publish; failures are logged, never
    /// propagated.
    pub async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) {
        if let Err(e) = self
            .client
            .publish(topic.clone(), QoS::AtLeastOnce, retain, payload)
            .await
        {
            log::debug!("Broker publish to {topic} failed: {e}");
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Extracts the MAC from a `fossibot/{mac}/command` topic.
pub fn command_topic_mac(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("fossibot/")?;
    let (mac, tail) = rest.split_once('/')?;
    if tail != "command" || mac.len() != 12 || !mac.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(mac)
}

pub fn state_topic(mac: &str) -> String {
    format!("fossibot/{mac}/state")
}

pub fn availability_topic(mac: &str) -> String {
    format!("fossibot/{mac}/availability")
}

pub const BRIDGE_STATUS_TOPIC: &str = "fossibot/bridge/status";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_command_mac() {
        assert_eq!(
            command_topic_mac("fossibot/7C2C67AB5F0E/command"),
            Some("7C2C67AB5F0E")
        );
        assert_eq!(command_topic_mac("fossibot/7C2C67AB5F0E/state"), None);
        assert_eq!(command_topic_mac("fossibot/bridge/status"), None);
        assert_eq!(command_topic_mac("other/7C2C67AB5F0E/command"), None);
        assert_eq!(command_topic_mac("fossibot/short/command"), None);
    }

    #[test]
    fn topic_builders() {
        assert_eq!(state_topic("7C2C67AB5F0E"), "fossibot/7C2C67AB5F0E/state");
        assert_eq!(
            availability_topic("7C2C67AB5F0E"),
            "fossibot/7C2C67AB5F0E/availability"
        );
    }
}

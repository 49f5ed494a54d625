//! Broker sink.
//!
//! Records go to `{topic}/pack-{n}/sensors`; `{topic}/availability` carries
//! `online` after every state message and `offline` as the last will.
pub mod discovery;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use rumqttc::{Client, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};

use crate::{
    api::{
        records::PackRecord,
        traits::{PublishError, PublishSink},
    },
    cli::config::{DiscoveryConfig, MqttConfig},
};
use discovery::DiscoveryBuilder;

const REQUEST_CAPACITY: usize = 256;
/// Discovery configs queued back to back before a pause, so a burst never
/// takes more than a fraction of the request queue away from state messages.
const DISCOVERY_BATCH: usize = 32;
const DISCOVERY_PAUSE: Duration = Duration::from_millis(100);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

pub fn state_topic(topic: &str, address: u8) -> String {
    format!("{topic}/pack-{address}/sensors")
}

pub fn availability_topic(topic: &str) -> String {
    format!("{topic}/availability")
}

pub struct MqttSink {
    client: Client,
    topic: String,
    closing: Arc<AtomicBool>,
    finished: flume::Receiver<()>,
}

impl MqttSink {
    /// Start the connection worker. Connecting and reconnecting happen in
    /// the background; records published while offline are rejected.
    pub fn connect(mqtt: &MqttConfig, discovery: &DiscoveryConfig, packs: Vec<u8>) -> Self {
        let client_id = format!("seplos_{}", uuid::Uuid::new_v4());
        let availability = availability_topic(&mqtt.topic);

        let mut options = MqttOptions::new(&client_id, mqtt.host.as_str(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(5)));
        options.set_last_will(LastWill::new(
            availability.as_str(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &mqtt.username {
            options.set_credentials(username, mqtt.password.clone().unwrap_or_default());
        }

        log::info!(
            "MQTT: connecting to {}:{} as {client_id}, topic: {}",
            mqtt.host,
            mqtt.port,
            mqtt.topic
        );
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

        let closing = Arc::new(AtomicBool::new(false));
        let (finished_tx, finished) = flume::bounded(1);
        let (announce_tx, announce_rx) = flume::bounded::<()>(1);

        let status_topic = if discovery.enabled {
            let messages = collect_discovery(&mqtt.topic, discovery, &packs);
            let announcer = client.clone();
            let stop = closing.clone();
            thread::spawn(move || {
                while announce_rx.recv().is_ok() {
                    publish_discovery(&announcer, &messages, &stop);
                }
            });
            Some(DiscoveryBuilder::new(&mqtt.topic, discovery).status_topic())
        } else {
            drop(announce_rx);
            None
        };

        let subscriber = client.clone();
        let stop = closing.clone();
        thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("MQTT: connected");
                        if let Some(status_topic) = &status_topic {
                            if let Err(err) =
                                subscriber.try_subscribe(status_topic.as_str(), QoS::AtLeastOnce)
                            {
                                log::warn!("MQTT: subscribing to {status_topic} failed: {err}");
                            }
                            let _ = announce_tx.try_send(());
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let is_status = status_topic
                            .as_deref()
                            .is_some_and(|topic| publish.topic == topic);
                        if is_status && publish.payload.as_ref() == ONLINE.as_bytes() {
                            log::info!("MQTT: home automation came online, republishing discovery");
                            let _ = announce_tx.try_send(());
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        log::warn!("MQTT: connection error: {err}");
                        thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
            let _ = finished_tx.send(());
        });

        Self {
            client,
            topic: mqtt.topic.clone(),
            closing,
            finished,
        }
    }
}

fn collect_discovery(
    topic: &str,
    config: &DiscoveryConfig,
    packs: &[u8],
) -> Vec<discovery::DiscoveryMessage> {
    let builder = DiscoveryBuilder::new(topic, config);
    let mut messages = Vec::new();
    for &pack in packs {
        match builder.messages(pack) {
            Ok(pack_messages) => messages.extend(pack_messages),
            Err(err) => log::error!("Pack{pack}: building discovery payloads failed: {err}"),
        }
    }
    messages
}

/// Publish `messages` in order, calling `pause` after every `batch` of them.
/// Stops at the first failure; otherwise returns how many were sent.
fn publish_paced<E>(
    messages: &[discovery::DiscoveryMessage],
    batch: usize,
    mut publish: impl FnMut(&discovery::DiscoveryMessage) -> Result<(), E>,
    mut pause: impl FnMut(),
) -> Result<usize, E> {
    for (index, message) in messages.iter().enumerate() {
        if index > 0 && index % batch.max(1) == 0 {
            pause();
        }
        publish(message)?;
    }
    Ok(messages.len())
}

fn publish_discovery(
    client: &Client,
    messages: &[discovery::DiscoveryMessage],
    closing: &AtomicBool,
) {
    let sent = publish_paced(
        messages,
        DISCOVERY_BATCH,
        |message| {
            if closing.load(Ordering::Acquire) {
                return Err("sink is closing".to_string());
            }
            client
                .publish(
                    message.topic.as_str(),
                    QoS::AtLeastOnce,
                    true,
                    message.payload.as_bytes(),
                )
                .map_err(|err| format!("{}: {err}", message.topic))
        },
        || thread::sleep(DISCOVERY_PAUSE),
    );
    match sent {
        Ok(count) => log::info!("MQTT: published {count} discovery configs"),
        Err(err) => log::warn!("MQTT: discovery publish stopped: {err}"),
    }
}

impl PublishSink for MqttSink {
    fn publish(&mut self, record: &PackRecord) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(record).map_err(|source| PublishError::Serialize {
            address: record.address,
            source,
        })?;
        let rejected = |err: rumqttc::ClientError| PublishError::Rejected {
            address: record.address,
            reason: err.to_string(),
        };
        self.client
            .try_publish(
                state_topic(&self.topic, record.address),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .map_err(rejected)?;
        self.client
            .try_publish(
                availability_topic(&self.topic),
                QoS::AtMostOnce,
                true,
                ONLINE,
            )
            .map_err(rejected)
    }

    fn close(&mut self) -> Result<(), PublishError> {
        self.closing.store(true, Ordering::Release);
        let offline = self.client.try_publish(
            availability_topic(&self.topic),
            QoS::AtLeastOnce,
            true,
            OFFLINE,
        );
        if let Err(err) = offline {
            log::warn!("MQTT: could not announce offline: {err}");
        }
        if let Err(err) = self.client.disconnect() {
            log::warn!("MQTT: disconnect failed: {err}");
        }
        if self.finished.recv_timeout(CLOSE_TIMEOUT).is_err() {
            log::warn!("MQTT: connection did not close within {CLOSE_TIMEOUT:?}");
        }
        Ok(())
    }
}

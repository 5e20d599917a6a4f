//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Inbound message model, routing, and event sources."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use emeter_common::config::BrokerConfig;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tracing::{debug, info, warn};

use crate::source::EventSource;
use crate::types::InboundEvent;
use crate::{MessagingError, Result};

const REQUEST_CAPACITY: usize = 16;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Event source subscribed to an MQTT broker.
///
/// The subscription is (re)issued on every CONNACK so a session restored by
/// the event loop after a network drop keeps receiving readings. A failure
/// before the first successful CONNACK is fatal.
pub struct MqttEventSource {
    client: AsyncClient,
    event_loop: EventLoop,
    subscription: String,
    connected_once: bool,
}

impl MqttEventSource {
    /// Build the client from broker settings. Host, username and password are required.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        config
            .require_session()
            .map_err(|err| MessagingError::Config(err.to_string()))?;
        let host = config.host.clone().unwrap_or_default();
        let mut options = MqttOptions::new(config.client_id.clone(), host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(
            config.username.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        );

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Self {
            client,
            event_loop,
            subscription: config.subscription.clone(),
            connected_once: false,
        })
    }
}

#[async_trait]
impl EventSource for MqttEventSource {
    async fn next_event(&mut self) -> Result<Option<InboundEvent>> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(MessagingError::Refused(format!("{:?}", ack.code)));
                    }
                    info!(filter = %self.subscription, "connected to broker; subscribing");
                    self.connected_once = true;
                    self.client
                        .subscribe(self.subscription.clone(), QoS::AtMostOnce)
                        .await?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(InboundEvent::new(
                        publish.topic,
                        publish.payload,
                        Utc::now(),
                    )));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, return_codes = ?ack.return_codes, "subscription acknowledged");
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(MessagingError::Refused(format!("{:?}", code)));
                }
                Err(err) if !self.connected_once => {
                    return Err(MessagingError::Connection(err.to_string()));
                }
                Err(err) => {
                    warn!(error = %err, "broker connection lost; reconnecting");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected_once {
            self.client.disconnect().await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl std::fmt::Debug for MqttEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttEventSource")
            .field("subscription", &self.subscription)
            .field("connected_once", &self.connected_once)
            .finish_non_exhaustive()
    }
}

//! MQTT broker backed by `rumqttc`.

use super::{Broker, BrokerConnection, BrokerEndpoint, BrokerError};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the client's request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Connects to an MQTT server over plain TCP.
#[derive(Debug, Clone)]
pub struct MqttBroker {
    /// How long to wait for the broker's CONNACK
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for MqttBroker {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Poll the event loop until the broker accepts or refuses the connection.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Drive the event loop until our DISCONNECT has been sent or the connection drops.
async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("[MQTT] Disconnect sent");
                break;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("[MQTT] Received message from topic: {}", publish.topic);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[MQTT] Connection lost: {}", e);
                break;
            }
        }
    }
}

impl Broker for MqttBroker {
    fn connect<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerConnection>, BrokerError>> {
        Box::pin(async move {
            info!("[MQTT] connecting to host: {}", endpoint);
            let mut options =
                MqttOptions::new(endpoint.client_id.as_str(), endpoint.host.as_str(), endpoint.port);
            options.set_keep_alive(self.keep_alive);

            let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
            let connect_error = |reason: String| BrokerError::Connect {
                endpoint: endpoint.to_string(),
                reason,
            };

            tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop))
                .await
                .map_err(|_| connect_error(format!("no answer within {:?}", self.connect_timeout)))?
                .map_err(connect_error)?;
            info!("[MQTT] Connected");

            let connection: Box<dyn BrokerConnection> = Box::new(MqttConnection {
                client,
                event_loop: tokio::spawn(drive(eventloop)),
            });
            Ok(connection)
        })
    }
}

struct MqttConnection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl BrokerConnection for MqttConnection {
    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|e| BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn disconnect(self: Box<Self>, grace: Duration) -> BoxFuture<'static, Result<(), BrokerError>> {
        let MqttConnection {
            client,
            mut event_loop,
        } = *self;
        Box::pin(async move {
            if let Err(e) = client.disconnect().await {
                event_loop.abort();
                return Err(BrokerError::Disconnect(e.to_string()));
            }
            if tokio::time::timeout(grace, &mut event_loop).await.is_err() {
                warn!("[MQTT] Disconnect did not complete within {:?}", grace);
                event_loop.abort();
            }
            Ok(())
        })
    }
}

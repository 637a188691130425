//! Message broker abstraction.
//!
//! The publisher needs a broker it can connect to, publish on and disconnect
//! from. [`mqtt::MqttBroker`] talks to a real MQTT server;
//! [`memory::MemoryBroker`] records publishes for dry runs and tests.

pub mod memory;
pub mod mqtt;

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Where to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error type for broker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("can't connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// An open broker connection.
pub trait BrokerConnection: Send {
    /// Publish at most once, without retain. Resolves once the client has
    /// accepted the message, not when the broker has.
    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Disconnect, giving queued messages up to `grace` to go out.
    fn disconnect(self: Box<Self>, grace: Duration) -> BoxFuture<'static, Result<(), BrokerError>>;
}

/// Something that can open broker connections.
pub trait Broker: Send + Sync {
    fn connect<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerConnection>, BrokerError>>;
}

//! In-memory broker.
//!
//! Records every publish instead of sending it anywhere. Backs `--dry-run`
//! and lets tests assert on exactly what would have been published.

use super::{Broker, BrokerConnection, BrokerEndpoint, BrokerError};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A message accepted by a [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Log {
    connects: usize,
    disconnects: usize,
    published: Vec<PublishedMessage>,
}

/// Broker that keeps published messages in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    log: Arc<Mutex<Log>>,
    connect_error: Option<String>,
    failing_topic: Option<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection with `reason`.
    pub fn failing_connect(mut self, reason: &str) -> Self {
        self.connect_error = Some(reason.to_string());
        self
    }

    /// Reject publishes to `topic`.
    pub fn failing_topic(mut self, topic: &str) -> Self {
        self.failing_topic = Some(topic.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.with_log(|log| log.connects)
    }

    pub fn disconnects(&self) -> usize {
        self.with_log(|log| log.disconnects)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.with_log(|log| log.published.clone())
    }

    fn with_log<T: Default>(&self, f: impl FnOnce(&mut Log) -> T) -> T {
        self.log.lock().map(|mut log| f(&mut log)).unwrap_or_default()
    }
}

impl Broker for MemoryBroker {
    fn connect<'a>(
        &'a self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerConnection>, BrokerError>> {
        Box::pin(async move {
            self.with_log(|log| log.connects += 1);
            if let Some(reason) = &self.connect_error {
                return Err(BrokerError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: reason.clone(),
                });
            }
            let connection: Box<dyn BrokerConnection> = Box::new(MemoryConnection {
                broker: self.clone(),
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

impl BrokerConnection for MemoryConnection {
    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.broker.failing_topic.as_deref() == Some(topic) {
                return Err(BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: "rejected".into(),
                });
            }
            self.broker.with_log(|log| {
                log.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    payload,
                })
            });
            Ok(())
        })
    }

    fn disconnect(self: Box<Self>, _grace: Duration) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.broker.with_log(|log| log.disconnects += 1);
            Ok(())
        })
    }
}

//! Publishing assembled messages in one broker session.

use crate::broker::{Broker, BrokerEndpoint, BrokerError};
use crate::output::PayloadFormatter;
use crate::payload::OutboundMessage;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default grace period for queued messages when disconnecting.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(1000);

/// Errors that stop the whole publish step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error(transparent)]
    Connect(BrokerError),
}

/// What happened to a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
}

/// Publish every message over a single connection.
///
/// An empty batch does not connect at all. A message that cannot be encoded
/// or published is logged with its topic and skipped.
pub async fn publish_all(
    broker: &dyn Broker,
    endpoint: &BrokerEndpoint,
    messages: &[OutboundMessage],
    formatter: &dyn PayloadFormatter,
    grace: Duration,
) -> Result<PublishReport, PublishError> {
    let mut report = PublishReport::default();
    if messages.is_empty() {
        info!("Nothing to publish");
        return Ok(report);
    }

    let mut connection = broker
        .connect(endpoint)
        .await
        .map_err(PublishError::Connect)?;

    for message in messages {
        let body = match formatter.format(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                error!("[MQTT] {} for topic {}", e, message.topic);
                report.failed += 1;
                continue;
            }
        };

        debug!(
            "[MQTT] Sending payload to {}: {}",
            message.topic,
            String::from_utf8_lossy(&body)
        );
        match connection.publish(&message.topic, body).await {
            Ok(()) => report.published += 1,
            Err(e) => {
                error!("[MQTT] {}", e);
                report.failed += 1;
            }
        }
    }

    if let Err(e) = connection.disconnect(grace).await {
        warn!("[MQTT] {}", e);
    }

    info!(
        "[MQTT] Published {} of {} messages",
        report.published,
        messages.len()
    );
    Ok(report)
}

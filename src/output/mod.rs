//! Payload encoders.
//!
//! This module provides a trait for encoding sensor payloads into message
//! bodies and the JSON implementation published to the broker.

pub mod json;

use crate::payload::SensorPayload;
use thiserror::Error;

/// Error returned when a payload cannot be encoded.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("can't marshal payload: {0}")]
pub struct SerializationError(pub String);

/// Trait for encoding payloads into message bodies.
pub trait PayloadFormatter: Send + Sync {
    /// Encode a payload.
    ///
    /// # Arguments
    /// * `payload` - The sensor payload to encode
    ///
    /// # Returns
    /// The encoded message body
    fn format(&self, payload: &SensorPayload) -> Result<Vec<u8>, SerializationError>;
}

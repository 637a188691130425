//! JSON payload encoder.

use crate::output::{PayloadFormatter, SerializationError};
use crate::payload::SensorPayload;

/// Encodes payloads as compact JSON objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError(err.to_string())
    }
}

impl PayloadFormatter for JsonFormatter {
    fn format(&self, payload: &SensorPayload) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(payload)?)
    }
}

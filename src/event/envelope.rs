//! Wire envelope shared by every producer and consumer.
//!
//! Serialized as camelCase JSON:
//!
//! ```json
//! {
//!   "eventId": "4f0c…",
//!   "eventType": "payment.created",
//!   "timestamp": 1725000000000,
//!   "data": { "amount": 42 },
//!   "metadata": { "service": "payments", "userId": "u-1", "traceId": "…" }
//! }
//! ```
//!
//! `data` is opaque to this crate; the producing service owns its shape.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::utils::{EventError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent {
    pub event_id: String,
    pub event_type: String,
    /// Milliseconds since the UNIX epoch, set at publish time.
    pub timestamp: i64,
    pub data: Value,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form extension fields, serialized inline next to `service`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventMetadata {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl BaseEvent {
    /// Builds a fresh envelope with a new `eventId` and the current time.
    pub fn new(event_type: impl Into<String>, data: Value, metadata: EventMetadata) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
            metadata,
        }
    }

    /// The routing key on the exchange always equals the event type.
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(EventError::Serialization)
    }

    /// Decodes a delivery body. Missing fields, bad JSON and blank
    /// `eventId`/`eventType` values are all reported as
    /// [`EventError::Deserialization`].
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let event: BaseEvent = serde_json::from_slice(body).map_err(EventError::Deserialization)?;
        if event.event_id.trim().is_empty() {
            return Err(EventError::Deserialization(serde_json::Error::custom(
                "eventId must not be empty",
            )));
        }
        if event.event_type.trim().is_empty() {
            return Err(EventError::Deserialization(serde_json::Error::custom(
                "eventType must not be empty",
            )));
        }
        Ok(event)
    }

    /// Decodes `data` into an application type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(EventError::Deserialization)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

/// Payload schema version written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// Wire-format envelope for every control-plane message.
///
/// Serialized with MessagePack. `topic` drives PUB/SUB filtering and reply
/// routing; `correlation_id` ties a dispatch to its reply and doubles as the
/// idempotency key for at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic (e.g. "exgraf.dispatch", "exgraf.worker.health").
    pub topic: String,

    /// MessagePack-encoded payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Schema version of `payload`.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    SCHEMA_VERSION
}

impl Message {
    /// New message with a fresh correlation id.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, BusError> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    /// Message carrying an explicit correlation id (dispatches keyed by a
    /// scheduler token, replies).
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, BusError> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: SCHEMA_VERSION,
        })
    }

    /// Build the reply to this message: same correlation id, new topic.
    pub fn reply<T: Serialize>(&self, topic: impl Into<String>, payload: &T) -> Result<Self, BusError> {
        Self::with_correlation(topic, payload, self.correlation_id)
    }

    /// Decode the payload, rejecting envelopes from a newer schema.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BusError> {
        if self.version > SCHEMA_VERSION {
            return Err(BusError::UnsupportedVersion {
                found: self.version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Serde adapter encoding `Vec<u8>` as a MessagePack bin instead of an
/// array of integers.
pub(crate) mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

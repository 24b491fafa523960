//! The per-pipeline dead-letter queue: the on-wire envelope and the client
//! used by the control plane to drain, inspect and purge it.

use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use common_bus::message::subjects;
use common_bus::{AckPolicy, BatchReader, BusClient, BusError, FailedMessage, Message, Record, Role};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on one DLQ fetch.
pub const MAX_DLQ_FETCH: usize = 100;

const DLQ_ACK_WAIT: Duration = Duration::from_secs(30);
const DLQ_MAX_ACK_PENDING: i64 = MAX_DLQ_FETCH as i64;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("no messages in the dead-letter queue")]
    NoMessages,
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// JSON envelope for one dead-lettered record. `payload` carries the
/// original record bytes, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub role: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl DlqEnvelope {
    pub fn from_failed(failed: &FailedMessage) -> Self {
        Self {
            role: failed.role.as_str().to_string(),
            error: failed.error.clone(),
            timestamp: Utc::now(),
            payload: failed.message.payload().to_vec(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DlqError> {
        serde_json::from_slice(bytes).map_err(|e| DlqError::InvalidEnvelope(e.to_string()))
    }

    /// The bus message publishing this envelope on the DLQ subject.
    pub fn into_message(self) -> Message {
        Message::produced(Record::new(self.encode()))
    }
}

mod base64_bytes {
    use super::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Aggregate DLQ state surfaced to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqState {
    pub last_received_at: Option<DateTime<Utc>>,
    pub last_consumed_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub unconsumed: u64,
}

/// Client over a pipeline's DLQ stream, with the durable ack-all consumer
/// `<stream>-consumer` shared across fetches.
pub struct DlqClient {
    bus: BusClient,
    pipeline: String,
}

impl DlqClient {
    pub fn new(bus: BusClient, pipeline: impl Into<String>) -> Self {
        Self {
            bus,
            pipeline: pipeline.into(),
        }
    }

    fn stream_name(&self) -> String {
        subjects::dlq_stream(&self.pipeline)
    }

    fn consumer_name(&self) -> String {
        format!("{}-consumer", self.stream_name())
    }

    async fn reader(&self) -> Result<impl BatchReader, DlqError> {
        let consumer = self
            .bus
            .create_consumer(
                &self.stream_name(),
                &self.consumer_name(),
                &subjects::dlq(&self.pipeline),
                AckPolicy::All,
                DLQ_ACK_WAIT,
                DLQ_MAX_ACK_PENDING,
            )
            .await?;
        Ok(self.bus.reader(consumer, true))
    }

    /// Pull up to `batch_size` envelopes and ack the last one (ack-all).
    pub async fn fetch(&self, batch_size: usize) -> Result<Vec<DlqEnvelope>, DlqError> {
        let batch_size = batch_size.clamp(1, MAX_DLQ_FETCH);
        let reader = self.reader().await?;
        let messages = reader.read_batch_no_wait(batch_size).await?;
        if messages.is_empty() {
            return Err(DlqError::NoMessages);
        }

        let mut envelopes = Vec::with_capacity(messages.len());
        for message in &messages {
            envelopes.push(DlqEnvelope::decode(message.payload())?);
        }
        reader.ack(&messages).await?;
        Ok(envelopes)
    }

    pub async fn state(&self) -> Result<DlqState, DlqError> {
        let stream = self.bus.get_stream(&self.stream_name()).await?;
        let mut stream = stream;
        let info = stream.info().await.map_err(BusError::fetch)?;

        let last_received_at = chrono::DateTime::from_timestamp(
            info.state.last_timestamp.unix_timestamp(),
            info.state.last_timestamp.nanosecond(),
        )
        .filter(|_| info.state.messages > 0);
        let total_messages = info.state.messages;

        let mut consumer = self
            .bus
            .create_consumer(
                &self.stream_name(),
                &self.consumer_name(),
                &subjects::dlq(&self.pipeline),
                AckPolicy::All,
                DLQ_ACK_WAIT,
                DLQ_MAX_ACK_PENDING,
            )
            .await?;
        let info = consumer.info().await.map_err(BusError::fetch)?;
        let unconsumed = info.num_pending;
        let last_consumed_at = info.delivered.last_active.and_then(|ts| {
            chrono::DateTime::from_timestamp(ts.unix_timestamp(), ts.nanosecond())
        });

        Ok(DlqState {
            last_received_at,
            last_consumed_at,
            total_messages,
            unconsumed,
        })
    }

    /// Delete every message on the DLQ subject.
    pub async fn purge(&self) -> Result<(), DlqError> {
        let stream = self.bus.get_stream(&self.stream_name()).await?;
        stream
            .purge()
            .await
            .map_err(BusError::stream_setup)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_bus::{Message, Record, Role};

    #[test]
    fn envelope_round_trips() {
        let envelope = DlqEnvelope {
            role: "transform".to_string(),
            error: "field tet not found".to_string(),
            timestamp: Utc::now(),
            payload: br#"{"id": 1}"#.to_vec(),
        };
        let decoded = DlqEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.role(), Some(Role::Transform));
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let envelope = DlqEnvelope {
            role: "sink".to_string(),
            error: "insert failed".to_string(),
            timestamp: Utc::now(),
            payload: b"\x00\x01binary".to_vec(),
        };
        let raw = envelope.encode();
        let wire: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            wire["payload"].as_str().unwrap(),
            BASE64_STANDARD.encode(b"\x00\x01binary")
        );
        assert_eq!(wire["role"], "sink");
    }

    #[test]
    fn from_failed_carries_role_error_and_bytes() {
        let message = Message::produced(Record::new(br#"{"id": 2}"#.to_vec()));
        let failed = FailedMessage::new(message, Role::Filter, "bad expression");
        let envelope = DlqEnvelope::from_failed(&failed);
        assert_eq!(envelope.role, "filter");
        assert_eq!(envelope.error, "bad expression");
        assert_eq!(envelope.payload, br#"{"id": 2}"#);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            DlqEnvelope::decode(b"not json"),
            Err(DlqError::InvalidEnvelope(_))
        ));
    }
}

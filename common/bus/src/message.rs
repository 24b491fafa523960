use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

/// Well-known header names carried on every record.
pub mod headers {
    /// Producer-side idempotency token; the bus collapses publishes sharing
    /// a token within the stream's duplicate window.
    pub const IDEMPOTENCY_KEY: &str = "Nats-Msg-Id";
    pub const SOURCE_ID: &str = "Gf-Source-Id";
    pub const SCHEMA_VERSION: &str = "Gf-Schema-Version";
    pub const RETRY_COUNT: &str = "Gf-Retry-Count";
    pub const KAFKA_TOPIC: &str = "Gf-Kafka-Topic";
    pub const KAFKA_PARTITION: &str = "Gf-Kafka-Partition";
    pub const KAFKA_OFFSET: &str = "Gf-Kafka-Offset";
}

/// Subject naming for one pipeline's wiring. Pipeline and source ids are
/// sanitized so they cannot produce wildcard or token-separator characters.
pub mod subjects {
    pub fn ingest(pipeline: &str, source: &str) -> String {
        format!("gf.{}.ingest.{}", sanitize(pipeline), sanitize(source))
    }

    /// Matches every source's ingest subject for the pipeline.
    pub fn ingest_wildcard(pipeline: &str) -> String {
        format!("gf.{}.ingest.>", sanitize(pipeline))
    }

    pub fn output(pipeline: &str) -> String {
        format!("gf.{}.out", sanitize(pipeline))
    }

    pub fn joined(pipeline: &str) -> String {
        format!("gf.{}.joined", sanitize(pipeline))
    }

    pub fn dlq(pipeline: &str) -> String {
        format!("gf.{}.dlq", sanitize(pipeline))
    }

    /// Stream (and KV) names use `-` instead of subject dots.
    pub fn stream_prefix(pipeline: &str) -> String {
        format!("gf-{}", sanitize(pipeline))
    }

    /// One stream carries every source's ingest subject (`gf.<p>.ingest.>`);
    /// consumers narrow to a source with a filter subject.
    pub fn ingest_stream(pipeline: &str) -> String {
        format!("gf-{}-ingest", sanitize(pipeline))
    }

    pub fn output_stream(pipeline: &str) -> String {
        format!("gf-{}-out", sanitize(pipeline))
    }

    pub fn joined_stream(pipeline: &str) -> String {
        format!("gf-{}-joined", sanitize(pipeline))
    }

    pub fn dlq_stream(pipeline: &str) -> String {
        format!("gf-{}-dlq", sanitize(pipeline))
    }

    pub fn dedup_bucket(pipeline: &str, source: &str) -> String {
        format!("gf-{}-dedup-{}", sanitize(pipeline), sanitize(source))
    }

    pub fn join_bucket(pipeline: &str, side: &str) -> String {
        format!("gf-{}-join-{}", sanitize(pipeline), sanitize(side))
    }

    pub fn sanitize(id: &str) -> String {
        id.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

/// The stage a failed message is attributed to; serialized into DLQ
/// envelopes as a lowercase label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ingestor,
    Filter,
    Dedup,
    Transform,
    Join,
    Sink,
    BatchWriter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Ingestor => "ingestor",
            Role::Filter => "filter",
            Role::Dedup => "dedup",
            Role::Transform => "transform",
            Role::Join => "join",
            Role::Sink => "sink",
            Role::BatchWriter => "batch-writer",
        }
    }

    pub fn parse(label: &str) -> Option<Role> {
        match label {
            "ingestor" => Some(Role::Ingestor),
            "filter" => Some(Role::Filter),
            "dedup" => Some(Role::Dedup),
            "transform" => Some(Role::Transform),
            "join" => Some(Role::Join),
            "sink" => Some(Role::Sink),
            "batch-writer" => Some(Role::BatchWriter),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque payload plus an ordered header multimap. The payload is
/// immutable after construction; headers can only gain entries.
#[derive(Debug, Clone, Default)]
pub struct Record {
    payload: Bytes,
    headers: Vec<(String, String)>,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// First value for the header, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// The acknowledgeable half of a bus delivery. Each of ack/nak/term may be
/// observed at most once; later calls are no-ops.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    async fn nak(&self) -> Result<(), BusError>;
    async fn term(&self) -> Result<(), BusError>;
}

struct JetStreamAcker {
    message: jetstream::Message,
    settled: AtomicBool,
}

impl JetStreamAcker {
    fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BusError> {
        if !self.settle() {
            return Ok(());
        }
        self.message.ack().await.map_err(BusError::Ack)
    }

    async fn nak(&self) -> Result<(), BusError> {
        if !self.settle() {
            return Ok(());
        }
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(BusError::Ack)
    }

    async fn term(&self) -> Result<(), BusError> {
        if !self.settle() {
            return Ok(());
        }
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(BusError::Ack)
    }
}

/// A record on its way through a pipeline: either freshly built by a stage
/// (to be published) or read off the bus with its delivery handle attached.
#[derive(Clone)]
pub enum Message {
    Produced(Record),
    Delivery {
        record: Record,
        handle: Arc<dyn Acker>,
    },
}

impl Message {
    pub fn produced(record: Record) -> Self {
        Message::Produced(record)
    }

    pub fn delivery(record: Record, handle: Arc<dyn Acker>) -> Self {
        Message::Delivery { record, handle }
    }

    pub(crate) fn from_jetstream(message: jetstream::Message) -> Self {
        let mut record = Record::new(message.payload.clone());
        if let Some(map) = message.headers.as_ref() {
            for (name, values) in map.iter() {
                for value in values.iter() {
                    record.add_header(name.to_string(), value.to_string());
                }
            }
        }
        let handle = Arc::new(JetStreamAcker {
            message,
            settled: AtomicBool::new(false),
        });
        Message::Delivery { record, handle }
    }

    pub fn record(&self) -> &Record {
        match self {
            Message::Produced(record) => record,
            Message::Delivery { record, .. } => record,
        }
    }

    pub fn payload(&self) -> &Bytes {
        self.record().payload()
    }

    pub fn is_delivery(&self) -> bool {
        matches!(self, Message::Delivery { .. })
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        match self {
            Message::Produced(_) => Err(BusError::NotADelivery),
            Message::Delivery { handle, .. } => handle.ack().await,
        }
    }

    pub async fn nak(&self) -> Result<(), BusError> {
        match self {
            Message::Produced(_) => Err(BusError::NotADelivery),
            Message::Delivery { handle, .. } => handle.nak().await,
        }
    }

    pub async fn term(&self) -> Result<(), BusError> {
        match self {
            Message::Produced(_) => Err(BusError::NotADelivery),
            Message::Delivery { handle, .. } => handle.term().await,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Produced(record) => f.debug_tuple("Produced").field(record).finish(),
            Message::Delivery { record, .. } => {
                f.debug_struct("Delivery").field("record", record).finish()
            }
        }
    }
}

/// A message a stage could not process, with the stage's role and the error
/// it observed. The DLQ middleware turns these into envelopes.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub message: Message,
    pub role: Role,
    pub error: String,
}

impl FailedMessage {
    pub fn new(message: Message, role: Role, error: impl Into<String>) -> Self {
        Self {
            message,
            role,
            error: error.into(),
        }
    }
}

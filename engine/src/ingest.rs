//! Kafka → bus ingestion. One ingestor task per topic; replicas of the same
//! pipeline share the topic through the consumer group.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_bus::message::{headers, subjects};
use common_bus::{BatchWriter, FailedMessage, Message, Record, Role};
use metrics::counter;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message as KafkaMessage};
use tracing::{info, warn};

use crate::config::{KafkaConnectionConfig, KafkaSecurityConfig, TopicConfig};
use crate::error::EngineError;
use crate::metric_consts::RECORDS_INGESTED;
use crate::process::dlq::publish_failed;
use crate::process::{Deduplicator, StageFailure};
use crate::schema::SourceSchema;
use crate::supervisor::{Operator, ShutdownSignal, StopMode};
use health::HealthHandle;

const PUBLISH_BATCH_SIZE: usize = 100;
const PUBLISH_LINGER: Duration = Duration::from_millis(100);
const PUBLISH_RETRIES: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Map the configured security surface onto librdkafka properties.
fn apply_security(client: &mut ClientConfig, security: &KafkaSecurityConfig) {
    match security.mechanism.as_deref() {
        Some(mechanism) => {
            let protocol = if security.tls { "sasl_ssl" } else { "sasl_plaintext" };
            client.set("security.protocol", protocol);
            // librdkafka has no native AWS_MSK_IAM mechanism; it rides on
            // OAUTHBEARER token callbacks
            let mechanism = match mechanism {
                "AWS_MSK_IAM" => "OAUTHBEARER",
                other => other,
            };
            client.set("sasl.mechanism", mechanism);
            if let Some(username) = &security.username {
                client.set("sasl.username", username);
            }
            if let Some(password) = &security.password {
                client.set("sasl.password", password);
            }
        }
        None if security.tls => {
            client.set("security.protocol", "ssl");
        }
        None => {}
    }
    if let Some(root_ca) = &security.root_ca {
        client.set("ssl.ca.location", root_ca);
    }
    if security.skip_verify {
        client.set("enable.ssl.certificate.verification", "false");
    }
}

fn build_client_config(
    connection: &KafkaConnectionConfig,
    topic: &TopicConfig,
) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", connection.brokers.join(","))
        .set("group.id", &connection.consumer_group)
        .set("statistics.interval.ms", "10000")
        .set("enable.auto.offset.store", "false")
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "5000");

    // "stored" resumes from committed offsets; the reset policy only kicks
    // in when the group has none
    let reset = match topic.starting_offset.as_str() {
        "latest" => "latest",
        _ => "earliest",
    };
    client.set("auto.offset.reset", reset);

    if let Some(security) = &connection.security {
        apply_security(&mut client, security);
    }
    client
}

/// The bus message for one Kafka record: normalized payload plus routing
/// headers and the idempotency token collapsing Kafka re-polls.
pub(crate) fn build_message(
    source_id: &str,
    schema_version: Option<&str>,
    schema: &SourceSchema,
    topic: &str,
    partition: i32,
    offset: i64,
    payload: &[u8],
) -> Result<Message, String> {
    let normalized = schema.normalize(payload).map_err(|e| e.to_string())?;
    let body = serde_json::to_vec(&normalized).map_err(|e| e.to_string())?;

    let mut record = Record::new(body);
    record.add_header(
        headers::IDEMPOTENCY_KEY,
        format!("{topic}_{partition}_{offset}"),
    );
    record.add_header(headers::SOURCE_ID, source_id);
    if let Some(version) = schema_version {
        record.add_header(headers::SCHEMA_VERSION, version);
    }
    record.add_header(headers::KAFKA_TOPIC, topic);
    record.add_header(headers::KAFKA_PARTITION, partition.to_string());
    record.add_header(headers::KAFKA_OFFSET, offset.to_string());
    Ok(Message::produced(record))
}

struct PendingOffset {
    partition: i32,
    offset: i64,
}

pub struct KafkaIngestor {
    name: String,
    source_id: String,
    schema_version: Option<String>,
    topic: String,
    consumer: StreamConsumer,
    writer: Arc<dyn BatchWriter>,
    dlq: Arc<dyn BatchWriter>,
    schema: SourceSchema,
    /// Ingest-side dedup for topics configured with one; applied before the
    /// publish, committed after it.
    dedup: Option<Deduplicator>,
    health: Option<HealthHandle>,
}

impl KafkaIngestor {
    pub fn new(
        pipeline: &str,
        connection: &KafkaConnectionConfig,
        topic: &TopicConfig,
        writer: Arc<dyn BatchWriter>,
        dlq: Arc<dyn BatchWriter>,
        schema: SourceSchema,
        dedup: Option<Deduplicator>,
    ) -> Result<Self, EngineError> {
        let consumer: StreamConsumer = build_client_config(connection, topic).create()?;
        consumer.subscribe(&[topic.name.as_str()])?;
        info!(
            topic = %topic.name,
            group = %connection.consumer_group,
            subject = %subjects::ingest(pipeline, topic.source_id()),
            "ingestor subscribed"
        );
        Ok(Self {
            name: format!("ingestor-{}", topic.source_id()),
            source_id: topic.source_id().to_string(),
            schema_version: topic.schema_version.clone(),
            topic: topic.name.clone(),
            consumer,
            writer,
            dlq,
            schema,
            dedup,
            health: None,
        })
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    /// Distinct operator name for replicas sharing a topic.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn flush(
        &self,
        buffer: &mut Vec<Message>,
        failed: &mut Vec<FailedMessage>,
        offsets: &mut Vec<PendingOffset>,
    ) -> Result<(), EngineError> {
        if buffer.is_empty() && failed.is_empty() {
            return Ok(());
        }

        let mut to_publish = std::mem::take(buffer);
        let mut dedup_keys = Vec::new();
        if let Some(dedup) = &self.dedup {
            let (kept, keys) = dedup
                .filter_batch(to_publish)
                .await
                .map_err(|e| EngineError::operator(&self.name, e))?;
            to_publish = kept;
            dedup_keys = keys;
        }

        if !to_publish.is_empty() {
            let mut attempt = 0;
            let rejected = loop {
                match self.writer.write_batch(&to_publish).await {
                    Ok(rejected) => break rejected,
                    Err(err) if attempt < PUBLISH_RETRIES => {
                        attempt += 1;
                        warn!(ingestor = %self.name, error = %err, attempt,
                            "bus publish failed, retrying");
                        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    }
                    Err(err) => return Err(EngineError::operator(&self.name, err)),
                }
            };
            if !rejected.is_empty() {
                publish_rejected(self.dlq.as_ref(), &rejected, &self.name).await?;
            }
            counter!(RECORDS_INGESTED, "source" => self.source_id.clone())
                .increment(to_publish.len() as u64);
        }

        if let Some(dedup) = &self.dedup {
            dedup
                .save_keys(&dedup_keys)
                .await
                .map_err(|e| EngineError::operator(&self.name, e))?;
        }

        if !failed.is_empty() {
            let dead = std::mem::take(failed);
            publish_rejected(self.dlq.as_ref(), &dead, &self.name).await?;
        }

        // offsets are only stored once the records are durable downstream;
        // auto-commit picks them up on its interval
        for pending in offsets.drain(..) {
            self.consumer
                .store_offset(&self.topic, pending.partition, pending.offset)?;
        }
        Ok(())
    }
}

async fn publish_rejected(
    dlq: &dyn BatchWriter,
    failed: &[FailedMessage],
    name: &str,
) -> Result<(), EngineError> {
    publish_failed(dlq, failed).await.map_err(|e| match e {
        StageFailure::Abort(err) => EngineError::operator(name, err),
        StageFailure::Fatal(message) => EngineError::operator(name, message),
    })
}

#[async_trait]
impl Operator for KafkaIngestor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError> {
        let mut buffer: Vec<Message> = Vec::with_capacity(PUBLISH_BATCH_SIZE);
        let mut failed: Vec<FailedMessage> = Vec::new();
        let mut offsets: Vec<PendingOffset> = Vec::new();

        loop {
            if let Some(health) = &self.health {
                health.report_healthy();
            }
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(PUBLISH_LINGER, self.consumer.recv()) => received,
            };

            match received {
                Ok(Ok(kafka_message)) => {
                    let partition = kafka_message.partition();
                    let offset = kafka_message.offset();
                    let payload = kafka_message
                        .payload()
                        .map(<[u8]>::to_vec)
                        .unwrap_or_default();
                    // the borrowed message must not cross the flush await
                    drop(kafka_message);

                    match build_message(
                        &self.source_id,
                        self.schema_version.as_deref(),
                        &self.schema,
                        &self.topic,
                        partition,
                        offset,
                        &payload,
                    ) {
                        Ok(message) => buffer.push(message),
                        Err(error) => {
                            let original = Message::produced(Record::new(payload));
                            failed.push(FailedMessage::new(original, Role::Ingestor, error));
                        }
                    }
                    offsets.push(PendingOffset { partition, offset });

                    if buffer.len() + failed.len() >= PUBLISH_BATCH_SIZE {
                        self.flush(&mut buffer, &mut failed, &mut offsets).await?;
                    }
                }
                Ok(Err(err)) => {
                    warn!(ingestor = %self.name, error = %err, "kafka receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                }
                // linger elapsed with nothing new; push out what we have
                Err(_) => self.flush(&mut buffer, &mut failed, &mut offsets).await?,
            }
        }

        if shutdown.mode() == StopMode::Drain {
            self.flush(&mut buffer, &mut failed, &mut offsets).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use serde_json::json;

    #[test]
    fn built_messages_carry_routing_headers_and_token() {
        let schema = SourceSchema::default();
        let message = build_message(
            "orders",
            Some("v2"),
            &schema,
            "orders-topic",
            3,
            1421,
            br#"{"id": 1}"#,
        )
        .unwrap();

        let record = message.record();
        assert_eq!(
            record.header(headers::IDEMPOTENCY_KEY),
            Some("orders-topic_3_1421")
        );
        assert_eq!(record.header(headers::SOURCE_ID), Some("orders"));
        assert_eq!(record.header(headers::SCHEMA_VERSION), Some("v2"));
        assert_eq!(record.header(headers::KAFKA_TOPIC), Some("orders-topic"));
        assert_eq!(record.header(headers::KAFKA_PARTITION), Some("3"));
        assert_eq!(record.header(headers::KAFKA_OFFSET), Some("1421"));
    }

    #[test]
    fn schema_mapping_normalizes_payloads() {
        let schema = SourceSchema {
            fields: vec![FieldDef {
                name: "id".into(),
                field_type: FieldType::Int,
                required: true,
            }],
        };
        let message =
            build_message("s", None, &schema, "t", 0, 0, br#"{"id": "7"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
        assert_eq!(value, json!({"id": 7}));
    }

    #[test]
    fn mapping_errors_are_reported() {
        let schema = SourceSchema {
            fields: vec![FieldDef {
                name: "id".into(),
                field_type: FieldType::Int,
                required: true,
            }],
        };
        let result = build_message("s", None, &schema, "t", 0, 0, br#"{"x": 1}"#);
        assert!(result.is_err());
        let result = build_message("s", None, &schema, "t", 0, 0, b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn security_mapping_sets_librdkafka_properties() {
        let mut client = ClientConfig::new();
        apply_security(
            &mut client,
            &KafkaSecurityConfig {
                mechanism: Some("SCRAM-SHA-512".into()),
                username: Some("user".into()),
                password: Some("pass".into()),
                tls: true,
                root_ca: Some("/etc/ca.pem".into()),
                skip_verify: true,
            },
        );
        assert_eq!(client.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("sasl.username"), Some("user"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ca.pem"));
        assert_eq!(
            client.get("enable.ssl.certificate.verification"),
            Some("false")
        );
    }

    #[test]
    fn msk_iam_rides_on_oauthbearer() {
        let mut client = ClientConfig::new();
        apply_security(
            &mut client,
            &KafkaSecurityConfig {
                mechanism: Some("AWS_MSK_IAM".into()),
                tls: true,
                ..Default::default()
            },
        );
        assert_eq!(client.get("sasl.mechanism"), Some("OAUTHBEARER"));
    }

    #[test]
    fn plain_tls_without_sasl() {
        let mut client = ClientConfig::new();
        apply_security(
            &mut client,
            &KafkaSecurityConfig {
                tls: true,
                ..Default::default()
            },
        );
        assert_eq!(client.get("security.protocol"), Some("ssl"));
        assert_eq!(client.get("sasl.mechanism"), None);
    }
}

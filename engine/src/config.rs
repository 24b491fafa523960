use std::path::Path;
use std::time::Duration;

use common_bus::BusConfig;
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::schema::{JoinMapping, SinkMapping, SourceSchema};

/// Process-level settings, read from the environment. Everything describing
/// the pipeline itself comes from the JSON config file.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub bus: BusConfig,

    // Seconds an operator may go without reporting before the liveness
    // probe flags it
    #[envconfig(default = "60")]
    pub liveness_deadline_seconds: u64,
}

/// The `engine --config <path>` document: one pipeline, JSON-encoded, with
/// `stream_consumer`, `clickhouse_sink`, `batch` and `schema` sections plus
/// the optional stage sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,

    pub stream_consumer: StreamConsumerConfig,

    #[serde(default)]
    pub filter: Option<FilterConfig>,

    #[serde(default)]
    pub transform: Option<TransformConfig>,

    #[serde(default)]
    pub join: Option<JoinConfig>,

    pub clickhouse_sink: ClickHouseSinkConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub schema: SchemaConfig,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(EngineError::Config("pipeline_id must not be empty".into()));
        }
        if self.stream_consumer.topics.is_empty() {
            return Err(EngineError::Config(
                "stream_consumer.topics must not be empty".into(),
            ));
        }
        if self.batch.max_size == 0 {
            return Err(EngineError::Config("batch.max_size must be >= 1".into()));
        }
        if let Some(join) = &self.join {
            if join.kind != JoinKind::Temporal {
                return Err(EngineError::Config("join.type must be \"temporal\"".into()));
            }
            let sources: Vec<&str> = self
                .stream_consumer
                .topics
                .iter()
                .map(|t| t.source_id())
                .collect();
            for side in [&join.left_source, &join.right_source] {
                if !sources.iter().any(|s| s == side) {
                    return Err(EngineError::Config(format!(
                        "join references unknown source {side}"
                    )));
                }
            }
            if self.filter.is_some() || self.transform.is_some() {
                return Err(EngineError::Config(
                    "filter/transform stages are not supported together with a join; \
                     the join consumes the ingest subjects directly"
                        .into(),
                ));
            }
        }
        for topic in &self.stream_consumer.topics {
            if topic.replicas == 0 {
                return Err(EngineError::Config(format!(
                    "topic {}: replicas must be >= 1",
                    topic.name
                )));
            }
        }
        if let Some(transform) = &self.transform {
            if transform.rules.is_empty() {
                return Err(EngineError::Config(
                    "transform.rules must not be empty when the stage is configured".into(),
                ));
            }
        }
        Ok(())
    }

    /// Source ids in topic order.
    pub fn source_ids(&self) -> Vec<String> {
        self.stream_consumer
            .topics
            .iter()
            .map(|t| t.source_id().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConsumerConfig {
    /// Override for the bus server; falls back to the environment.
    #[serde(default)]
    pub nats_server: Option<String>,

    pub kafka: KafkaConnectionConfig,

    pub topics: Vec<TopicConfig>,

    /// Retention for the pipeline's bus streams.
    #[serde(default = "default_stream_max_age_seconds")]
    pub max_age_seconds: u64,

    /// Producer-side duplicate window on the ingest streams, collapsing
    /// Kafka re-polls by idempotency token.
    #[serde(default = "default_bus_dedup_window_seconds")]
    pub bus_dedup_window_seconds: u64,
}

impl StreamConsumerConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    pub fn bus_dedup_window(&self) -> Duration {
        Duration::from_secs(self.bus_dedup_window_seconds)
    }
}

fn default_stream_max_age_seconds() -> u64 {
    24 * 60 * 60
}

fn default_bus_dedup_window_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConnectionConfig {
    pub brokers: Vec<String>,

    pub consumer_group: String,

    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,
}

/// SASL/TLS surface, mapped onto librdkafka properties by the ingestor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// PLAIN | SCRAM-SHA-256 | SCRAM-SHA-512 | GSSAPI | OAUTHBEARER |
    /// AWS_MSK_IAM (mapped to OAUTHBEARER)
    #[serde(default)]
    pub mechanism: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub root_ca: Option<String>,

    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,

    /// Source id used in subjects and headers; defaults to the topic name.
    #[serde(default)]
    pub source_id: Option<String>,

    #[serde(default)]
    pub schema_version: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// earliest | latest | stored
    #[serde(default = "default_starting_offset")]
    pub starting_offset: String,

    #[serde(default)]
    pub deduplication: Option<DedupConfig>,
}

impl TopicConfig {
    pub fn source_id(&self) -> &str {
        self.source_id.as_deref().unwrap_or(&self.name)
    }
}

fn default_replicas() -> u32 {
    1
}

fn default_starting_offset() -> String {
    "earliest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Dotted path to the dedup key inside the payload.
    pub key: String,

    #[serde(default = "default_dedup_window_seconds")]
    pub window_seconds: u64,
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

fn default_dedup_window_seconds() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Records matching the expression are dropped.
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub rules: Vec<TransformRule>,

    /// Shards per batch for the processor chain; 1 keeps strict order.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRule {
    pub expression: String,
    pub output: String,
    /// string | int | float | bool | json
    #[serde(rename = "type", default = "default_output_type")]
    pub output_type: String,
}

fn default_output_type() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Temporal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(rename = "type")]
    pub kind: JoinKind,

    pub left_source: String,
    pub right_source: String,

    pub left_key: String,
    pub right_key: String,

    #[serde(default = "default_join_window_seconds")]
    pub left_window_seconds: u64,

    #[serde(default = "default_join_window_seconds")]
    pub right_window_seconds: u64,
}

impl JoinConfig {
    pub fn left_window(&self) -> Duration {
        Duration::from_secs(self.left_window_seconds)
    }

    pub fn right_window(&self) -> Duration {
        Duration::from_secs(self.right_window_seconds)
    }
}

fn default_join_window_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseSinkConfig {
    /// HTTP(S) address of the ClickHouse server.
    pub addr: String,

    pub database: String,
    pub table: String,

    #[serde(default = "default_ch_user")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub skip_verify: bool,
}

fn default_ch_user() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,

    #[serde(default = "default_batch_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl BatchConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_delay_ms: default_batch_max_delay_ms(),
        }
    }
}

fn default_batch_max_size() -> usize {
    1000
}

fn default_batch_max_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Per-source ingest schemas, keyed by source id.
    #[serde(default)]
    pub sources: std::collections::HashMap<String, SourceSchema>,

    /// Sink column mapping, in INSERT column order.
    #[serde(default)]
    pub sink: SinkMapping,

    /// Join output rules, when a join is configured.
    #[serde(default)]
    pub join: JoinMapping,
}

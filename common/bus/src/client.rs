use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    kv,
    stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType, Stream},
};
use futures::TryStreamExt;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::subjects;
use crate::reader::JetStreamReader;
use crate::writer::JetStreamWriter;

const CONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const CONNECT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Thin wrapper over one NATS connection and its JetStream context, shared
/// by every operator of a pipeline. Provisioning calls are idempotent so a
/// restarted pipeline reuses its streams, consumers and buckets by name.
#[derive(Clone)]
pub struct BusClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: BusConfig,
}

impl BusClient {
    /// Connect with exponential backoff inside the configured total wait
    /// budget. Gives up with a typed error once the budget is exhausted.
    pub async fn connect(config: BusConfig) -> Result<Self, BusError> {
        let budget = config.max_connection_wait();
        let deadline = Instant::now() + budget;
        let mut backoff = CONNECT_INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match async_nats::ConnectOptions::new()
                .connect(config.nats_server.as_str())
                .await
            {
                Ok(client) => {
                    info!(server = %config.nats_server, attempts, "connected to bus");
                    let jetstream = jetstream::new(client.clone());
                    return Ok(Self {
                        client,
                        jetstream,
                        config,
                    });
                }
                Err(err) => {
                    if Instant::now() + backoff >= deadline {
                        warn!(server = %config.nats_server, attempts, error = %err,
                            "bus connection budget exhausted");
                        return Err(BusError::ConnectBudgetExhausted {
                            url: config.nats_server.clone(),
                            attempts,
                            budget,
                        });
                    }
                    debug!(server = %config.nats_server, attempts, error = %err,
                        backoff_ms = backoff.as_millis() as u64, "bus connection failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_MAX_BACKOFF);
                }
            }
        }
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create or reconcile a stream: file storage, limits retention,
    /// discard-oldest, the given max age, and an optional producer-side
    /// duplicate window.
    pub async fn ensure_stream(
        &self,
        name: &str,
        subject: &str,
        max_age: Duration,
        dedup_window: Option<Duration>,
    ) -> Result<Stream, BusError> {
        let config = StreamConfig {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::Old,
            storage: StorageType::File,
            max_age,
            duplicate_window: dedup_window.unwrap_or_default(),
            ..Default::default()
        };

        if self.jetstream.get_stream(name).await.is_ok() {
            self.jetstream
                .update_stream(&config)
                .await
                .map_err(BusError::stream_setup)?;
            debug!(stream = name, subject, "stream updated");
            self.jetstream
                .get_stream(name)
                .await
                .map_err(BusError::stream_setup)
        } else {
            let stream = self
                .jetstream
                .get_or_create_stream(config)
                .await
                .map_err(BusError::stream_setup)?;
            debug!(stream = name, subject, "stream created");
            Ok(stream)
        }
    }

    pub async fn get_stream(&self, name: &str) -> Result<Stream, BusError> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|_| BusError::StreamNotFound(name.to_string()))
    }

    /// Create the KV bucket if it does not exist. The TTL applies per entry,
    /// which is what bounds the dedup and join windows.
    pub async fn ensure_kv(&self, bucket: &str, ttl: Duration) -> Result<kv::Store, BusError> {
        if let Ok(store) = self.jetstream.get_key_value(bucket).await {
            return Ok(store);
        }
        self.jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                max_age: ttl,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(BusError::kv_setup)
    }

    pub async fn kv(&self, bucket: &str) -> Result<kv::Store, BusError> {
        self.jetstream
            .get_key_value(bucket)
            .await
            .map_err(BusError::kv_setup)
    }

    /// Durable pull consumer, reused across restarts by name.
    pub async fn create_consumer(
        &self,
        stream: &str,
        name: &str,
        filter_subject: &str,
        ack_policy: AckPolicy,
        ack_wait: Duration,
        max_ack_pending: i64,
    ) -> Result<PullConsumer, BusError> {
        let stream = self.get_stream(stream).await?;
        stream
            .get_or_create_consumer(
                name,
                pull::Config {
                    durable_name: Some(name.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy,
                    ack_wait,
                    max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .map_err(BusError::consumer_setup)
    }

    pub fn reader(&self, consumer: PullConsumer, ack_all: bool) -> JetStreamReader {
        JetStreamReader::new(consumer, ack_all)
    }

    pub fn writer(&self, subject: impl Into<String>) -> JetStreamWriter {
        JetStreamWriter::new(
            self.jetstream.clone(),
            subject,
            self.config.publisher_max_pending_acks,
            self.config.publisher_max_retry_wait(),
        )
    }

    /// Delete every stream and KV bucket belonging to the pipeline, bounded
    /// by the cleanup timeout.
    pub async fn cleanup(&self, pipeline: &str) -> Result<(), BusError> {
        let budget = self.config.cleanup_timeout();
        timeout(budget, self.cleanup_inner(pipeline))
            .await
            .map_err(|_| BusError::Timeout(budget))?
    }

    async fn cleanup_inner(&self, pipeline: &str) -> Result<(), BusError> {
        let prefix = subjects::stream_prefix(pipeline);
        // KV buckets are streams named KV_<bucket>
        let kv_prefix = format!("KV_{prefix}");

        let names: Vec<String> = self
            .jetstream
            .stream_names()
            .try_collect()
            .await
            .map_err(BusError::stream_setup)?;

        for name in names {
            if name.starts_with(&prefix) || name.starts_with(&kv_prefix) {
                match self.jetstream.delete_stream(&name).await {
                    Ok(_) => info!(stream = %name, "deleted pipeline stream"),
                    Err(err) => {
                        warn!(stream = %name, error = %err, "failed to delete pipeline stream");
                        return Err(BusError::stream_setup(err));
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(BusError::publish)
    }
}

//! Wires one pipeline's operators to the bus: provisions streams, consumers
//! and KV buckets, builds the operator set from the config, and hands the
//! running set to a supervisor.
//!
//! Topologies:
//! - plain: ingestors → `gf.<p>.ingest.<source>` → component → `gf.<p>.out`
//!   → sink, with filter/dedup/transform as the component's chain;
//! - join: two ingestors (dedup applied ingest-side per topic config) →
//!   join over the two ingest subjects → `gf.<p>.joined` → sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_bus::kv::KvKeyStore;
use common_bus::message::subjects;
use common_bus::{AckPolicy, BatchWriter, BusClient};
use health::HealthRegistry;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::ingest::KafkaIngestor;
use crate::join::{JoinSide, TemporalJoin};
use crate::process::{
    Component, ComponentSettings, ConcurrentProcessor, DedupProcessor, Deduplicator,
    DlqMiddleware, FilterProcessor, Processor, TransformProcessor,
};
use crate::sink::{ClickHouseInserter, ClickHouseSink, SinkSettings};
use crate::supervisor::Supervisor;

const ACK_WAIT: Duration = Duration::from_secs(30);
const MAX_ACK_PENDING: i64 = 1000;
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Idempotently create the pipeline's streams. The ingest stream carries a
/// producer duplicate window so Kafka re-polls collapse by idempotency
/// token; the others do not need one.
pub async fn provision(bus: &BusClient, config: &PipelineConfig) -> Result<(), EngineError> {
    let pipeline = &config.pipeline_id;
    let max_age = config.stream_consumer.max_age();

    bus.ensure_stream(
        &subjects::ingest_stream(pipeline),
        &subjects::ingest_wildcard(pipeline),
        max_age,
        Some(config.stream_consumer.bus_dedup_window()),
    )
    .await?;
    bus.ensure_stream(
        &subjects::dlq_stream(pipeline),
        &subjects::dlq(pipeline),
        max_age,
        None,
    )
    .await?;
    if config.join.is_some() {
        bus.ensure_stream(
            &subjects::joined_stream(pipeline),
            &subjects::joined(pipeline),
            max_age,
            None,
        )
        .await?;
    } else {
        bus.ensure_stream(
            &subjects::output_stream(pipeline),
            &subjects::output(pipeline),
            max_age,
            None,
        )
        .await?;
    }
    Ok(())
}

async fn dedup_for_topic(
    bus: &BusClient,
    pipeline: &str,
    source: &str,
    config: &crate::config::DedupConfig,
) -> Result<Deduplicator, EngineError> {
    let store = bus
        .ensure_kv(&subjects::dedup_bucket(pipeline, source), config.window())
        .await?;
    Ok(Deduplicator::new(
        Arc::new(KvKeyStore::new(store)),
        &config.key,
    ))
}

/// Build and start every operator of the pipeline, in dependency order:
/// sink first, then the processing component or join, then the ingestors.
pub async fn start(
    bus: &BusClient,
    config: &PipelineConfig,
    registry: &HealthRegistry,
    liveness_deadline: Duration,
) -> Result<Supervisor, EngineError> {
    provision(bus, config).await?;

    let pipeline = &config.pipeline_id;
    let prefix = subjects::stream_prefix(pipeline);
    let mut supervisor = Supervisor::new(SUPERVISOR_STOP_TIMEOUT);
    let dlq_writer: Arc<dyn BatchWriter> = Arc::new(bus.writer(subjects::dlq(pipeline)));

    // sink
    let (sink_stream, sink_subject) = if config.join.is_some() {
        (subjects::joined_stream(pipeline), subjects::joined(pipeline))
    } else {
        (subjects::output_stream(pipeline), subjects::output(pipeline))
    };
    let sink_consumer = bus
        .create_consumer(
            &sink_stream,
            &format!("{prefix}-sink"),
            &sink_subject,
            AckPolicy::All,
            ACK_WAIT,
            MAX_ACK_PENDING,
        )
        .await?;
    let sink = ClickHouseSink::new(
        Arc::new(bus.reader(sink_consumer, true)),
        dlq_writer.clone(),
        Arc::new(ClickHouseInserter::new(&config.clickhouse_sink)),
        config.schema.sink.clone(),
        SinkSettings {
            max_batch_size: config.batch.max_size,
            max_delay: config.batch.max_delay(),
            ..Default::default()
        },
    )
    .with_health(registry.register("sink", liveness_deadline));
    supervisor.spawn(Arc::new(sink));

    if let Some(join) = &config.join {
        let left_store = bus
            .ensure_kv(&subjects::join_bucket(pipeline, "left"), join.left_window())
            .await?;
        let right_store = bus
            .ensure_kv(
                &subjects::join_bucket(pipeline, "right"),
                join.right_window(),
            )
            .await?;
        let left_consumer = bus
            .create_consumer(
                &subjects::ingest_stream(pipeline),
                &format!("{prefix}-join-left"),
                &subjects::ingest(pipeline, &join.left_source),
                AckPolicy::Explicit,
                ACK_WAIT,
                MAX_ACK_PENDING,
            )
            .await?;
        let right_consumer = bus
            .create_consumer(
                &subjects::ingest_stream(pipeline),
                &format!("{prefix}-join-right"),
                &subjects::ingest(pipeline, &join.right_source),
                AckPolicy::Explicit,
                ACK_WAIT,
                MAX_ACK_PENDING,
            )
            .await?;
        let join_operator = TemporalJoin::new(
            JoinSide::new(
                &join.left_source,
                Arc::new(bus.reader(left_consumer, false)),
                Arc::new(KvKeyStore::new(left_store)),
                &join.left_key,
            ),
            JoinSide::new(
                &join.right_source,
                Arc::new(bus.reader(right_consumer, false)),
                Arc::new(KvKeyStore::new(right_store)),
                &join.right_key,
            ),
            Arc::new(bus.writer(subjects::joined(pipeline))),
            config.schema.join.clone(),
        );
        supervisor.spawn(Arc::new(join_operator));
    } else {
        let mut processors: Vec<Box<dyn Processor>> = Vec::new();
        if let Some(filter) = &config.filter {
            processors.push(DlqMiddleware::wrap(
                Box::new(FilterProcessor::new(&filter.expression)?),
                dlq_writer.clone(),
            ));
        }
        let mut dedups = HashMap::new();
        for topic in &config.stream_consumer.topics {
            if let Some(dedup) = topic.deduplication.as_ref().filter(|d| d.enabled) {
                dedups.insert(
                    topic.source_id().to_string(),
                    Arc::new(dedup_for_topic(bus, pipeline, topic.source_id(), dedup).await?),
                );
            }
        }
        if !dedups.is_empty() {
            processors.push(DlqMiddleware::wrap(
                Box::new(DedupProcessor::new(dedups)),
                dlq_writer.clone(),
            ));
        }
        if let Some(transform) = &config.transform {
            let stage: Box<dyn Processor> = Box::new(TransformProcessor::new(&transform.rules)?);
            let stage: Box<dyn Processor> = if transform.concurrency > 1 {
                Box::new(ConcurrentProcessor::new(
                    Arc::from(stage),
                    transform.concurrency,
                ))
            } else {
                stage
            };
            processors.push(DlqMiddleware::wrap(stage, dlq_writer.clone()));
        }

        let component_consumer = bus
            .create_consumer(
                &subjects::ingest_stream(pipeline),
                &format!("{prefix}-component"),
                &subjects::ingest_wildcard(pipeline),
                AckPolicy::Explicit,
                ACK_WAIT,
                MAX_ACK_PENDING,
            )
            .await?;
        let component = Component::new(
            "component",
            Arc::new(bus.reader(component_consumer, false)),
            Arc::new(bus.writer(subjects::output(pipeline))),
            dlq_writer.clone(),
            processors,
            ComponentSettings::default(),
        )
        .with_health(registry.register("component", liveness_deadline));
        supervisor.spawn(Arc::new(component));
    }

    // ingestors last, so downstream consumers exist before records flow
    for topic in &config.stream_consumer.topics {
        let source = topic.source_id();
        let schema = config
            .schema
            .sources
            .get(source)
            .cloned()
            .unwrap_or_default();
        // with a join the per-record chain has no component to live in, so
        // topic dedup applies at the ingestor before the publish
        let ingest_dedup = if config.join.is_some() {
            match topic.deduplication.as_ref().filter(|d| d.enabled) {
                Some(dedup) => Some(dedup_for_topic(bus, pipeline, source, dedup).await?),
                None => None,
            }
        } else {
            None
        };

        for replica in 0..topic.replicas {
            let ingestor = KafkaIngestor::new(
                pipeline,
                &config.stream_consumer.kafka,
                topic,
                Arc::new(bus.writer(subjects::ingest(pipeline, source))),
                dlq_writer.clone(),
                schema.clone(),
                ingest_dedup.clone(),
            )?;
            let name = if topic.replicas > 1 {
                format!("ingestor-{source}-{replica}")
            } else {
                format!("ingestor-{source}")
            };
            let ingestor = ingestor
                .named(&name)
                .with_health(registry.register(name.clone(), liveness_deadline));
            supervisor.spawn(Arc::new(ingestor));
        }
    }

    info!(pipeline = %pipeline, "pipeline started");
    Ok(supervisor)
}

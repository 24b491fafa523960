use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_bus::{BatchReader, BatchWriter, Message};
use health::HealthHandle;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::metric_consts::{BATCH_NAKS, BATCH_SIZE, PROCESS_BATCH_TIME, RECORDS_PROCESSED};
use crate::process::dlq::publish_failed;
use crate::process::{run_chain, Processor, ProcessorBatch, StageFailure};
use crate::supervisor::{Operator, ShutdownSignal, StopMode};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ComponentSettings {
    pub read_batch_size: usize,
    pub read_wait: Duration,
    /// Budget for the drain-mode flush after the loop exits.
    pub shutdown_timeout: Duration,
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            read_batch_size: 100,
            read_wait: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// The read-process-write loop every intermediate stage runs on.
///
/// Per batch: processors run in order, survivors are written downstream,
/// broker-rejected writes are dead-lettered, stage commits run, and only
/// then is the input batch acked. Any failure before the ack naks the input
/// so the bus redelivers promptly; at-least-once falls out of that order.
pub struct Component {
    name: String,
    reader: Arc<dyn BatchReader>,
    writer: Arc<dyn BatchWriter>,
    dlq: Arc<dyn BatchWriter>,
    processors: Vec<Box<dyn Processor>>,
    settings: ComponentSettings,
    health: Option<HealthHandle>,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        reader: Arc<dyn BatchReader>,
        writer: Arc<dyn BatchWriter>,
        dlq: Arc<dyn BatchWriter>,
        processors: Vec<Box<dyn Processor>>,
        settings: ComponentSettings,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            dlq,
            processors,
            settings,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    async fn process_batch(&self, batch: &[Message]) -> Result<(), StageFailure> {
        let timer = common_metrics::timing_guard(PROCESS_BATCH_TIME, &[]);
        histogram!(BATCH_SIZE, "component" => self.name.clone()).record(batch.len() as f64);

        let result = run_chain(&self.processors, ProcessorBatch::new(batch.to_vec())).await?;

        if result.messages.is_empty() {
            // everything was filtered, deduped or dead-lettered
            self.reader
                .ack(batch)
                .await
                .map_err(|e| StageFailure::Abort(e.into()))?;
            timer.label("outcome", "drained").fin();
            return Ok(());
        }

        let rejected = self
            .writer
            .write_batch(&result.messages)
            .await
            .map_err(|e| StageFailure::Abort(e.into()))?;
        if !rejected.is_empty() {
            publish_failed(self.dlq.as_ref(), &rejected).await?;
        }

        // stage-local effects (dedup keys) commit after downstream
        // durability, before the input ack
        for commit in result.commits {
            commit.await.map_err(StageFailure::Abort)?;
        }

        self.reader
            .ack(batch)
            .await
            .map_err(|e| StageFailure::Abort(e.into()))?;

        counter!(RECORDS_PROCESSED, "component" => self.name.clone())
            .increment(result.messages.len() as u64);
        timer.label("outcome", "written").fin();
        Ok(())
    }

    /// Process one batch; aborts nak the input and let the loop continue,
    /// fatal failures bubble up and stop the operator.
    pub async fn handle_batch(&self, batch: Vec<Message>) -> Result<(), EngineError> {
        match self.process_batch(&batch).await {
            Ok(()) => Ok(()),
            Err(StageFailure::Abort(err)) => {
                warn!(component = %self.name, error = %err, "batch aborted, nak for redelivery");
                counter!(BATCH_NAKS, "component" => self.name.clone()).increment(1);
                if let Err(nak_err) = self.reader.nak(&batch).await {
                    warn!(component = %self.name, error = %nak_err, "nak failed");
                }
                Ok(())
            }
            Err(StageFailure::Fatal(message)) => {
                drop(self.reader.nak(&batch).await);
                Err(EngineError::operator(&self.name, message))
            }
        }
    }

    async fn drain(&self) {
        let flush = async {
            match self.reader.read_batch_no_wait(self.settings.read_batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    debug!(component = %self.name, len = batch.len(), "draining pending batch");
                    if let Err(err) = self.handle_batch(batch).await {
                        warn!(component = %self.name, error = %err, "drain flush failed");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(component = %self.name, error = %err, "drain read failed"),
            }
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, flush)
            .await
            .is_err()
        {
            warn!(component = %self.name, "drain flush timed out");
        }
    }
}

#[async_trait]
impl Operator for Component {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError> {
        loop {
            if let Some(health) = &self.health {
                health.report_healthy();
            }
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self
                    .reader
                    .read_batch(self.settings.read_batch_size, self.settings.read_wait) => batch,
            };
            match batch {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => self.handle_batch(batch).await?,
                Err(err) => {
                    warn!(component = %self.name, error = %err, "batch read failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if shutdown.mode() == StopMode::Drain {
            self.drain().await;
        }

        for processor in &self.processors {
            processor.close().await;
        }
        Ok(())
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use common_bus::{BatchWriter, FailedMessage, Message, Role};
use metrics::counter;
use tracing::{error, warn};

use crate::dlq::DlqEnvelope;
use crate::metric_consts::DLQ_WRITES;
use crate::process::{Processor, ProcessorBatch, StageFailure};

/// Convert failed messages into envelopes and publish them on the DLQ
/// subject. A DLQ that cannot be written is a pipeline-fatal condition; the
/// engine refuses to silently drop records.
pub async fn publish_failed(
    dlq: &dyn BatchWriter,
    failed: &[FailedMessage],
) -> Result<(), StageFailure> {
    if failed.is_empty() {
        return Ok(());
    }
    let envelopes: Vec<Message> = failed
        .iter()
        .map(|f| DlqEnvelope::from_failed(f).into_message())
        .collect();

    let rejected = dlq.write_batch(&envelopes).await.map_err(|err| {
        error!(error = %err, "dead-letter publish failed");
        StageFailure::Fatal(format!("dead-letter publish failed: {err}"))
    })?;
    if !rejected.is_empty() {
        error!(rejected = rejected.len(), "dead-letter publish rejected by broker");
        return Err(StageFailure::Fatal(format!(
            "dead-letter publish rejected for {} message(s)",
            rejected.len()
        )));
    }

    counter!(DLQ_WRITES).increment(failed.len() as u64);
    for failure in failed {
        warn!(role = %failure.role, error = %failure.error, "record dead-lettered");
    }
    Ok(())
}

/// Wraps a processor so that, after the wrapped call, its failed messages
/// are dead-lettered and cleared from the result.
pub struct DlqMiddleware {
    inner: Box<dyn Processor>,
    dlq: Arc<dyn BatchWriter>,
}

impl DlqMiddleware {
    pub fn wrap(inner: Box<dyn Processor>, dlq: Arc<dyn BatchWriter>) -> Box<Self> {
        Box::new(Self { inner, dlq })
    }
}

#[async_trait]
impl Processor for DlqMiddleware {
    fn role(&self) -> Role {
        self.inner.role()
    }

    async fn process(&self, batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure> {
        let mut result = self.inner.process(batch).await?;
        publish_failed(self.dlq.as_ref(), &result.failed).await?;
        result.failed.clear();
        Ok(result)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DlqEnvelope;
    use crate::process::FilterProcessor;
    use common_bus::testing::{delivery, InMemoryWriter};
    use std::sync::Arc;

    #[tokio::test]
    async fn failed_messages_become_envelopes_and_are_cleared() {
        let dlq = Arc::new(InMemoryWriter::new("gf.p1.dlq"));
        let filter = Box::new(FilterProcessor::new("age < 18").unwrap());
        let middleware = DlqMiddleware::wrap(filter, dlq.clone());

        let messages = vec![
            delivery(r#"{"age": 30}"#).0,
            delivery(r#"{"name": "no-age"}"#).0,
        ];
        let batch = middleware
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();

        assert_eq!(batch.messages.len(), 1);
        assert!(batch.failed.is_empty());

        let written = dlq.written();
        assert_eq!(written.len(), 1);
        let envelope = DlqEnvelope::decode(written[0].payload()).unwrap();
        assert_eq!(envelope.role, "filter");
        assert_eq!(envelope.payload, br#"{"name": "no-age"}"#);
    }

    #[tokio::test]
    async fn dlq_write_failure_is_pipeline_fatal() {
        let dlq = Arc::new(InMemoryWriter::new("gf.p1.dlq"));
        dlq.error_writes(true);
        let filter = Box::new(FilterProcessor::new("age < 18").unwrap());
        let middleware = DlqMiddleware::wrap(filter, dlq);

        let messages = vec![delivery(r#"{"name": "no-age"}"#).0];
        let result = middleware.process(ProcessorBatch::new(messages)).await;
        assert!(matches!(result, Err(StageFailure::Fatal(_))));
    }

    #[tokio::test]
    async fn broker_rejects_are_pipeline_fatal_too() {
        let dlq = Arc::new(InMemoryWriter::new("gf.p1.dlq"));
        dlq.reject_all(true);
        let filter = Box::new(FilterProcessor::new("age < 18").unwrap());
        let middleware = DlqMiddleware::wrap(filter, dlq);

        let messages = vec![delivery(r#"{"name": "no-age"}"#).0];
        let result = middleware.process(ProcessorBatch::new(messages)).await;
        assert!(matches!(result, Err(StageFailure::Fatal(_))));
    }

    #[tokio::test]
    async fn clean_batches_touch_nothing() {
        let dlq = Arc::new(InMemoryWriter::new("gf.p1.dlq"));
        dlq.error_writes(true); // would fail if anything were written
        let filter = Box::new(FilterProcessor::new("age < 18").unwrap());
        let middleware = DlqMiddleware::wrap(filter, dlq);

        let messages = vec![delivery(r#"{"age": 30}"#).0];
        let batch = middleware
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use common_bus::Role;
use futures::future::try_join_all;

use crate::process::{Processor, ProcessorBatch, StageFailure};

/// Shards a batch into N sub-batches and pipes each through the wrapped
/// processor in parallel. Results merge in shard order, so ordering inside a
/// shard is preserved while cross-shard delivery order is not; pipelines
/// that need strict order keep concurrency at 1.
pub struct ConcurrentProcessor {
    inner: Arc<dyn Processor>,
    shards: usize,
}

impl ConcurrentProcessor {
    pub fn new(inner: Arc<dyn Processor>, shards: usize) -> Self {
        Self {
            inner,
            shards: shards.max(1),
        }
    }
}

#[async_trait]
impl Processor for ConcurrentProcessor {
    fn role(&self) -> Role {
        self.inner.role()
    }

    async fn process(&self, mut batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure> {
        if self.shards == 1 || batch.messages.len() <= 1 {
            return self.inner.process(batch).await;
        }

        let messages = std::mem::take(&mut batch.messages);
        let chunk_size = messages.len().div_ceil(self.shards);
        let futures: Vec<_> = messages
            .chunks(chunk_size)
            .map(|chunk| {
                let inner = self.inner.clone();
                let sub = ProcessorBatch::new(chunk.to_vec());
                async move { inner.process(sub).await }
            })
            .collect();

        // the first fatal error short-circuits the merge
        let results = try_join_all(futures).await?;
        for result in results {
            batch.messages.extend(result.messages);
            batch.failed.extend(result.failed);
            batch.commits.extend(result.commits);
        }
        Ok(batch)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FilterProcessor;
    use common_bus::testing::delivery;

    #[tokio::test]
    async fn shards_merge_in_shard_order() {
        let filter = Arc::new(FilterProcessor::new("drop == true").unwrap());
        let processor = ConcurrentProcessor::new(filter, 3);

        let messages = (0..9)
            .map(|i| delivery(&format!(r#"{{"i":{i},"drop":false}}"#)).0)
            .collect();
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();

        let order: Vec<i64> = batch
            .messages
            .iter()
            .map(|m| {
                serde_json::from_slice::<serde_json::Value>(m.payload()).unwrap()["i"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        // contiguous chunks merged in shard order preserve the original
        // order when every shard completes
        assert_eq!(order, (0..9).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_from_all_shards_are_collected() {
        let filter = Arc::new(FilterProcessor::new("missing < 1").unwrap());
        let processor = ConcurrentProcessor::new(filter, 2);

        let messages = (0..4).map(|i| delivery(&format!(r#"{{"i":{i}}}"#)).0).collect();
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.failed.len(), 4);
    }

    #[tokio::test]
    async fn single_shard_delegates() {
        let filter = Arc::new(FilterProcessor::new("drop == true").unwrap());
        let processor = ConcurrentProcessor::new(filter, 1);
        let messages = vec![delivery(r#"{"drop":true}"#).0];
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert!(batch.messages.is_empty());
    }
}

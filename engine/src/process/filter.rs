use async_trait::async_trait;
use common_bus::{FailedMessage, Role};
use metrics::counter;
use serde_json::Value;

use crate::error::EngineError;
use crate::expr::Expression;
use crate::metric_consts::RECORDS_DROPPED;
use crate::process::{Processor, ProcessorBatch, StageFailure};

/// Boolean filter with match-means-drop semantics: the expression names the
/// records to remove, everything else passes. Evaluation errors classify
/// the record as failed; the DLQ middleware routes it out of the batch.
pub struct FilterProcessor {
    expression: Expression,
}

impl FilterProcessor {
    pub fn new(expression: &str) -> Result<Self, EngineError> {
        let expression = Expression::parse(expression)
            .map_err(|e| EngineError::Config(format!("invalid filter expression: {e}")))?;
        Ok(Self { expression })
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    fn role(&self) -> Role {
        Role::Filter
    }

    async fn process(&self, mut batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure> {
        let mut kept = Vec::with_capacity(batch.messages.len());
        let mut dropped = 0u64;

        for message in batch.messages {
            let payload: Value = match serde_json::from_slice(message.payload()) {
                Ok(value) => value,
                Err(err) => {
                    batch
                        .failed
                        .push(FailedMessage::new(message, Role::Filter, err.to_string()));
                    continue;
                }
            };
            match self.expression.matches(&payload) {
                Ok(true) => dropped += 1,
                Ok(false) => kept.push(message),
                Err(err) => {
                    batch
                        .failed
                        .push(FailedMessage::new(message, Role::Filter, err.to_string()));
                }
            }
        }

        if dropped > 0 {
            counter!(RECORDS_DROPPED, "role" => "filter").increment(dropped);
        }
        batch.messages = kept;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_bus::testing::delivery;

    async fn run(filter: &FilterProcessor, payloads: &[&str]) -> (Vec<String>, Vec<String>) {
        let messages = payloads.iter().map(|p| delivery(p).0).collect();
        let batch = filter.process(ProcessorBatch::new(messages)).await.unwrap();
        let kept = batch
            .messages
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
            .collect();
        let failed = batch.failed.iter().map(|f| f.error.clone()).collect();
        (kept, failed)
    }

    #[tokio::test]
    async fn matching_records_are_dropped() {
        let filter = FilterProcessor::new("age < 18").unwrap();
        let (kept, failed) = run(
            &filter,
            &[r#"{"age":15}"#, r#"{"age":25}"#, r#"{"age":10}"#],
        )
        .await;
        assert_eq!(kept, vec![r#"{"age":25}"#]);
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn evaluation_errors_become_failed_messages() {
        let filter = FilterProcessor::new("age < 18").unwrap();
        let (kept, failed) = run(&filter, &[r#"{"name":"x"}"#, r#"{"age":30}"#]).await;
        assert_eq!(kept, vec![r#"{"age":30}"#]);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("age"));
    }

    #[tokio::test]
    async fn invalid_json_becomes_a_failed_message() {
        let filter = FilterProcessor::new("age < 18").unwrap();
        let (kept, failed) = run(&filter, &["not json"]).await;
        assert!(kept.is_empty());
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn invalid_expression_is_a_config_error() {
        assert!(FilterProcessor::new("age <").is_err());
    }
}

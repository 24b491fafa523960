use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common_bus::kv::KeyStore;
use common_bus::message::headers;
use common_bus::{Message, Role};
use metrics::counter;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::FatalError;
use crate::metric_consts::RECORDS_DEDUPED;
use crate::process::{Processor, ProcessorBatch, StageFailure};

/// Hash the payload value at `path` into a store key: content-addressed, so
/// identical values collide by construction, and always a valid KV key.
pub(crate) fn content_key(payload: &[u8], path: &[String]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let mut current = &value;
    for segment in path {
        current = current.get(segment)?;
    }
    let canonical = match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let digest = Sha256::digest(canonical.as_bytes());
    Some(format!("{digest:x}"))
}

/// At-most-once within a window, backed by a content-addressed key store
/// whose per-entry TTL equals the window.
///
/// `filter_batch` is read-only: it collapses intra-batch duplicates (first
/// occurrence wins) and drops messages whose key is already stored.
/// `save_keys` is the commit step, run only after the downstream write and
/// ack succeeded; the split is what keeps redeliveries honest.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn KeyStore>,
    key_path: Vec<String>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn KeyStore>, key_path: &str) -> Self {
        Self {
            store,
            key_path: key_path.split('.').map(str::to_string).collect(),
        }
    }

    /// Content-addressed key for the payload's dedup field, or `None` when
    /// the field is absent (such records pass through as non-duplicates).
    pub fn key_of(&self, payload: &[u8]) -> Option<String> {
        content_key(payload, &self.key_path)
    }

    /// Drop duplicates from the batch; returns the survivors and the keys to
    /// commit for them. Performs no writes.
    pub async fn filter_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<(Vec<Message>, Vec<String>), FatalError> {
        let mut kept = Vec::with_capacity(messages.len());
        let mut keys = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for message in messages {
            let Some(key) = self.key_of(message.payload()) else {
                kept.push(message);
                continue;
            };
            if seen.contains(&key) {
                continue;
            }
            let stored = self
                .store
                .get(&key)
                .await
                .map_err(|e| FatalError::new(format!("dedup store read failed: {e}")))?;
            if stored.is_some() {
                continue;
            }
            seen.insert(key.clone());
            keys.push(key);
            kept.push(message);
        }
        Ok((kept, keys))
    }

    /// Commit step: mark the surviving keys, bounded by the bucket TTL.
    pub async fn save_keys(&self, keys: &[String]) -> Result<(), FatalError> {
        for key in keys {
            self.store
                .put_if_absent(key, Bytes::from_static(b"1"))
                .await
                .map_err(|e| FatalError::new(format!("dedup store write failed: {e}")))?;
        }
        Ok(())
    }
}

/// Chain stage applying per-source deduplication. Messages are routed to
/// their source's deduplicator via the source-id header; sources without a
/// dedup config pass through.
pub struct DedupProcessor {
    dedups: HashMap<String, Arc<Deduplicator>>,
}

impl DedupProcessor {
    pub fn new(dedups: HashMap<String, Arc<Deduplicator>>) -> Self {
        Self { dedups }
    }

    fn dedup_for(&self, message: &Message) -> Option<&Arc<Deduplicator>> {
        match message.record().header(headers::SOURCE_ID) {
            Some(source) => self.dedups.get(source),
            // single-source pipelines can miss the header in tests
            None if self.dedups.len() == 1 => self.dedups.values().next(),
            None => None,
        }
    }
}

#[async_trait]
impl Processor for DedupProcessor {
    fn role(&self) -> Role {
        Role::Dedup
    }

    async fn process(&self, mut batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure> {
        let mut kept = Vec::with_capacity(batch.messages.len());
        let mut per_source_seen: HashSet<String> = HashSet::new();
        let mut commit_keys: HashMap<String, Vec<String>> = HashMap::new();
        let mut dropped = 0u64;

        for message in std::mem::take(&mut batch.messages) {
            let Some(dedup) = self.dedup_for(&message) else {
                kept.push(message);
                continue;
            };
            let Some(key) = dedup.key_of(message.payload()) else {
                kept.push(message);
                continue;
            };
            let source = message
                .record()
                .header(headers::SOURCE_ID)
                .unwrap_or_default()
                .to_string();
            // dedup state is per source; the batch-local seen set is too
            if !per_source_seen.insert(format!("{source}|{key}")) {
                dropped += 1;
                continue;
            }
            let stored = dedup
                .store
                .get(&key)
                .await
                .map_err(|e| FatalError::new(format!("dedup store read failed: {e}")))?;
            if stored.is_some() {
                dropped += 1;
                continue;
            }
            commit_keys.entry(source).or_default().push(key);
            kept.push(message);
        }

        if dropped > 0 {
            counter!(RECORDS_DEDUPED).increment(dropped);
        }
        batch.messages = kept;

        if !commit_keys.is_empty() {
            let dedups = self.dedups.clone();
            let fallback = self.dedups.values().next().cloned();
            batch.commits.push(Box::pin(async move {
                for (source, keys) in commit_keys {
                    let dedup = dedups
                        .get(&source)
                        .or(fallback.as_ref())
                        .expect("commit keys only exist for configured sources");
                    dedup.save_keys(&keys).await?;
                }
                Ok(())
            }));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_bus::testing::{delivery, InMemoryKeyStore};

    fn processor(store: Arc<InMemoryKeyStore>) -> DedupProcessor {
        let dedup = Arc::new(Deduplicator::new(store, "id"));
        DedupProcessor::new(HashMap::from([(String::new(), dedup)]))
    }

    fn payloads(batch: &ProcessorBatch) -> Vec<String> {
        batch
            .messages
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn intra_batch_duplicates_collapse_first_wins() {
        let store = Arc::new(InMemoryKeyStore::new());
        let processor = processor(store);

        let messages = [
            r#"{"id":1}"#,
            r#"{"id":2}"#,
            r#"{"id":1,"later":true}"#,
            r#"{"id":3}"#,
            r#"{"id":2}"#,
        ]
        .iter()
        .map(|p| delivery(p).0)
        .collect();

        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert_eq!(
            payloads(&batch),
            vec![r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]
        );
    }

    #[tokio::test]
    async fn stored_keys_drop_redelivered_duplicates() {
        let store = Arc::new(InMemoryKeyStore::new());
        let dedup = Deduplicator::new(store.clone(), "id");
        let key = dedup.key_of(br#"{"id":1}"#).unwrap();
        dedup.save_keys(&[key]).await.unwrap();

        let processor = processor(store);
        let messages = vec![delivery(r#"{"id":1}"#).0, delivery(r#"{"id":2}"#).0];
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert_eq!(payloads(&batch), vec![r#"{"id":2}"#]);
    }

    #[tokio::test]
    async fn missing_key_passes_through() {
        let store = Arc::new(InMemoryKeyStore::new());
        let processor = processor(store.clone());

        let messages = vec![
            delivery(r#"{"other":1}"#).0,
            delivery(r#"{"other":1}"#).0,
        ];
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();
        assert_eq!(batch.messages.len(), 2);
        // nothing to commit for key-less records
        assert!(batch.commits.is_empty());
    }

    #[tokio::test]
    async fn keys_are_saved_only_at_commit() {
        let store = Arc::new(InMemoryKeyStore::new());
        let processor = processor(store.clone());

        let messages = vec![delivery(r#"{"id":1}"#).0];
        let mut batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();

        // filter ran, nothing written yet
        assert!(store.is_empty());

        for commit in batch.commits.drain(..) {
            commit.await.unwrap();
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn store_failure_aborts_the_batch() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.fail_ops(true);
        let processor = processor(store);

        let messages = vec![delivery(r#"{"id":1}"#).0];
        let result = processor.process(ProcessorBatch::new(messages)).await;
        assert!(matches!(result, Err(StageFailure::Abort(_))));
    }

    #[tokio::test]
    async fn key_is_content_addressed() {
        let store = Arc::new(InMemoryKeyStore::new());
        let dedup = Deduplicator::new(store, "user.id");
        let a = dedup.key_of(br#"{"user":{"id":"abc"}}"#).unwrap();
        let b = dedup.key_of(br#"{"user":{"id":"abc"},"noise":1}"#).unwrap();
        let c = dedup.key_of(br#"{"user":{"id":"abd"}}"#).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

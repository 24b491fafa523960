//! The temporal join operator: two input subscriptions keyed into two
//! TTL-bounded KV buckets, emitting a joined record when the counterpart
//! arrives within the window. TTL eviction provides the window bound; late
//! arrivals produce no output and no dead letter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common_bus::kv::KeyStore;
use common_bus::message::headers;
use common_bus::{BatchReader, BatchWriter, Message, Record};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::metric_consts::RECORDS_JOINED;
use crate::process::dedup::content_key;
use crate::schema::JoinMapping;
use crate::supervisor::{Operator, ShutdownSignal};

const READ_BATCH_SIZE: usize = 50;
const READ_WAIT: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

pub struct JoinSide {
    source: String,
    reader: Arc<dyn BatchReader>,
    store: Arc<dyn KeyStore>,
    key_path: Vec<String>,
}

impl JoinSide {
    pub fn new(
        source: impl Into<String>,
        reader: Arc<dyn BatchReader>,
        store: Arc<dyn KeyStore>,
        key_path: &str,
    ) -> Self {
        Self {
            source: source.into(),
            reader,
            store,
            key_path: key_path.split('.').map(str::to_string).collect(),
        }
    }
}

pub struct TemporalJoin {
    name: String,
    left: JoinSide,
    right: JoinSide,
    writer: Arc<dyn BatchWriter>,
    mapping: JoinMapping,
    // one handler at a time: a lookup-and-emit on one side must not race
    // the put on the other for the same key
    lock: Mutex<()>,
}

impl TemporalJoin {
    pub fn new(
        left: JoinSide,
        right: JoinSide,
        writer: Arc<dyn BatchWriter>,
        mapping: JoinMapping,
    ) -> Self {
        Self {
            name: "join".to_string(),
            left,
            right,
            writer,
            mapping,
            lock: Mutex::new(()),
        }
    }

    async fn emit(&self, left_payload: &[u8], right_payload: &[u8]) -> Result<(), String> {
        let merged = self
            .mapping
            .merge(left_payload, right_payload)
            .map_err(|e| e.to_string())?;
        let body = serde_json::to_vec(&merged).map_err(|e| e.to_string())?;
        let record = Record::new(body).with_header(headers::SOURCE_ID, self.name.clone());
        let rejected = self
            .writer
            .write_batch(&[Message::produced(record)])
            .await
            .map_err(|e| e.to_string())?;
        if !rejected.is_empty() {
            return Err("joined record rejected by broker".to_string());
        }
        counter!(RECORDS_JOINED).increment(1);
        Ok(())
    }

    /// Handle one message under the shared lock. Errors are returned so the
    /// caller can nak for redelivery.
    async fn handle(&self, side: Side, message: &Message) -> Result<(), String> {
        let (own, other) = match side {
            Side::Left => (&self.left, &self.right),
            Side::Right => (&self.right, &self.left),
        };

        let Some(key) = content_key(message.payload(), &own.key_path) else {
            // no join key, nothing to correlate
            debug!(source = %own.source, "record without join key skipped");
            message.ack().await.map_err(|e| e.to_string())?;
            return Ok(());
        };

        let counterpart = other.store.get(&key).await.map_err(|e| e.to_string())?;
        match counterpart {
            Some(found) => {
                match side {
                    Side::Left => self.emit(message.payload(), &found).await?,
                    Side::Right => {
                        self.emit(&found, message.payload()).await?;
                        // one left record joins at most one right counterpart;
                        // a failed delete means the entry expired underneath us
                        if let Err(err) = other.store.delete(&key).await {
                            debug!(error = %err, "left join entry delete failed, ignoring");
                        }
                    }
                }
            }
            None => {
                own.store
                    .put(&key, Bytes::copy_from_slice(message.payload()))
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        message.ack().await.map_err(|e| e.to_string())
    }

    async fn side_loop(&self, side: Side, shutdown: &ShutdownSignal) -> Result<(), EngineError> {
        let reader = match side {
            Side::Left => &self.left.reader,
            Side::Right => &self.right.reader,
        };
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = reader.read_batch(READ_BATCH_SIZE, READ_WAIT) => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(operator = %self.name, error = %err, "join read failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };
            // drain mode still finishes the in-flight batch before exiting
            for message in &batch {
                let _guard = self.lock.lock().await;
                if let Err(err) = self.handle(side, message).await {
                    warn!(operator = %self.name, error = %err, "join handler failed, nak");
                    if let Err(nak_err) = message.nak().await {
                        warn!(operator = %self.name, error = %nak_err, "join nak failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for TemporalJoin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError> {
        let left = self.side_loop(Side::Left, &shutdown);
        let right = self.side_loop(Side::Right, &shutdown);
        tokio::try_join!(left, right)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_bus::testing::{delivery, AckState, InMemoryKeyStore, InMemoryReader, InMemoryWriter};
    use serde_json::json;

    struct Fixture {
        join: TemporalJoin,
        left_store: Arc<InMemoryKeyStore>,
        right_store: Arc<InMemoryKeyStore>,
        writer: Arc<InMemoryWriter>,
    }

    fn fixture() -> Fixture {
        let left_store = Arc::new(InMemoryKeyStore::new());
        let right_store = Arc::new(InMemoryKeyStore::new());
        let writer = Arc::new(InMemoryWriter::new("gf.p1.joined"));
        let join = TemporalJoin::new(
            JoinSide::new(
                "left",
                Arc::new(InMemoryReader::new(false)),
                left_store.clone(),
                "userId",
            ),
            JoinSide::new(
                "right",
                Arc::new(InMemoryReader::new(false)),
                right_store.clone(),
                "userId",
            ),
            writer.clone(),
            JoinMapping::default(),
        );
        Fixture {
            join,
            left_store,
            right_store,
            writer,
        }
    }

    fn joined_payloads(writer: &InMemoryWriter) -> Vec<serde_json::Value> {
        writer
            .written()
            .iter()
            .map(|m| serde_json::from_slice(m.payload()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn pair_within_window_emits_exactly_once() {
        let f = fixture();

        let (left, left_acker) = delivery(r#"{"userId":"u","v":1}"#);
        f.join.handle(Side::Left, &left).await.unwrap();
        assert_eq!(left_acker.state(), AckState::Acked);
        // left waits in its bucket
        assert_eq!(f.left_store.len(), 1);
        assert!(f.writer.written().is_empty());

        let (right, right_acker) = delivery(r#"{"userId":"u","w":2}"#);
        f.join.handle(Side::Right, &right).await.unwrap();
        assert_eq!(right_acker.state(), AckState::Acked);

        assert_eq!(
            joined_payloads(&f.writer),
            vec![json!({"userId":"u","v":1,"w":2})]
        );
        // the left entry was consumed by the join
        assert!(f.left_store.is_empty());
        assert!(f.right_store.is_empty());
    }

    #[tokio::test]
    async fn expired_counterpart_means_no_join() {
        let f = fixture();

        let (left, _) = delivery(r#"{"userId":"u","v":1}"#);
        f.join.handle(Side::Left, &left).await.unwrap();

        // the window elapses before the right side arrives
        for key in [content_key(br#"{"userId":"u"}"#, &["userId".to_string()]).unwrap()] {
            f.left_store.expire(&key);
        }

        let (right, right_acker) = delivery(r#"{"userId":"u","w":2}"#);
        f.join.handle(Side::Right, &right).await.unwrap();

        assert!(f.writer.written().is_empty());
        assert_eq!(right_acker.state(), AckState::Acked);
        // the late right record now waits on its own side
        assert_eq!(f.right_store.len(), 1);
    }

    #[tokio::test]
    async fn left_joins_against_stored_right() {
        let f = fixture();

        let (right, _) = delivery(r#"{"userId":"u","w":2}"#);
        f.join.handle(Side::Right, &right).await.unwrap();
        assert_eq!(f.right_store.len(), 1);

        let (left, _) = delivery(r#"{"userId":"u","v":1}"#);
        f.join.handle(Side::Left, &left).await.unwrap();

        assert_eq!(
            joined_payloads(&f.writer),
            vec![json!({"userId":"u","v":1,"w":2})]
        );
    }

    #[tokio::test]
    async fn second_left_after_consumed_join_waits_again() {
        let f = fixture();

        let (left, _) = delivery(r#"{"userId":"u","v":1}"#);
        f.join.handle(Side::Left, &left).await.unwrap();
        let (right, _) = delivery(r#"{"userId":"u","w":2}"#);
        f.join.handle(Side::Right, &right).await.unwrap();
        assert_eq!(f.writer.written().len(), 1);

        // a second left with no new right emits nothing more
        let (left2, left2_acker) = delivery(r#"{"userId":"u","v":3}"#);
        f.join.handle(Side::Left, &left2).await.unwrap();
        assert_eq!(f.writer.written().len(), 1);
        assert_eq!(left2_acker.state(), AckState::Acked);
        assert_eq!(f.left_store.len(), 1);
    }

    #[tokio::test]
    async fn missing_join_key_is_acked_and_skipped() {
        let f = fixture();
        let (message, acker) = delivery(r#"{"other":"x"}"#);
        f.join.handle(Side::Left, &message).await.unwrap();
        assert_eq!(acker.state(), AckState::Acked);
        assert!(f.left_store.is_empty());
        assert!(f.writer.written().is_empty());
    }

    #[tokio::test]
    async fn store_errors_surface_for_nak() {
        let f = fixture();
        f.right_store.fail_ops(true);
        let (message, _) = delivery(r#"{"userId":"u"}"#);
        assert!(f.join.handle(Side::Left, &message).await.is_err());
    }
}

//! The ClickHouse sink: a ticker-and-size-driven batcher over the pipeline's
//! output consumer. Successful inserts piggy-back the bus ack (ack-all on
//! the last message); failed inserts dead-letter the whole fetch and ack it
//! message by message so the bus does not storm redeliveries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clickhouse::Row;
use common_bus::{BatchReader, BatchWriter, FailedMessage, Message, Role};
use health::HealthHandle;
use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ClickHouseSinkConfig;
use crate::error::EngineError;
use crate::metric_consts::{RECORDS_SUNK, SINK_FLUSH_TIME, SINK_INSERT_FAILURES};
use crate::process::dlq::publish_failed;
use crate::process::StageFailure;
use crate::schema::SinkMapping;
use crate::supervisor::{Operator, ShutdownSignal, StopMode};

const ACK_RETRIES: u32 = 3;
const ACK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Columnar insert seam; the ClickHouse client implements it, tests fake it.
#[async_trait]
pub trait RowInserter: Send + Sync {
    async fn insert(
        &self,
        columns: &[String],
        rows: &[Map<String, Value>],
    ) -> Result<(), EngineError>;
}

/// `system.columns` introspection row.
#[derive(Debug, Clone, Row, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Pooled ClickHouse connection over the HTTP interface. Inserts ship the
/// batch as `INSERT INTO db.table (cols…) FORMAT JSONEachRow` with one JSON
/// object per row.
pub struct ClickHouseInserter {
    client: clickhouse::Client,
    database: String,
    table: String,
}

impl ClickHouseInserter {
    pub fn new(config: &ClickHouseSinkConfig) -> Self {
        let mut client = clickhouse::Client::default()
            .with_url(&config.addr)
            .with_database(&config.database)
            .with_user(&config.username);
        if !config.password.is_empty() {
            client = client.with_password(&config.password);
        }
        Self {
            client,
            database: config.database.clone(),
            table: config.table.clone(),
        }
    }

    /// Target table schema for the control plane; never used on the hot path.
    pub async fn schema(&self) -> Result<Vec<TableColumn>, EngineError> {
        self.client
            .query(
                "SELECT name, type FROM system.columns \
                 WHERE database = ? AND table = ? ORDER BY position",
            )
            .bind(&self.database)
            .bind(&self.table)
            .fetch_all()
            .await
            .map_err(|e| EngineError::Sink(e.to_string()))
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(|e| EngineError::Sink(e.to_string()))
    }
}

fn build_insert_statement(
    database: &str,
    table: &str,
    columns: &[String],
    rows: &[Map<String, Value>],
) -> Result<String, EngineError> {
    let column_list = columns
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut statement =
        format!("INSERT INTO `{database}`.`{table}` ({column_list}) FORMAT JSONEachRow");
    for row in rows {
        statement.push('\n');
        statement
            .push_str(&serde_json::to_string(row).map_err(|e| EngineError::Sink(e.to_string()))?);
    }
    Ok(statement)
}

#[async_trait]
impl RowInserter for ClickHouseInserter {
    async fn insert(
        &self,
        columns: &[String],
        rows: &[Map<String, Value>],
    ) -> Result<(), EngineError> {
        if rows.is_empty() {
            return Ok(());
        }
        let statement = build_insert_statement(&self.database, &self.table, columns, rows)?;
        self.client
            .query(&statement)
            .execute()
            .await
            .map_err(|e| EngineError::Sink(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub max_batch_size: usize,
    pub max_delay: Duration,
    /// Pause between pending-count polls while below the size trigger.
    pub fetch_retry_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_delay: Duration::from_secs(1),
            fetch_retry_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ClickHouseSink {
    name: String,
    reader: Arc<dyn BatchReader>,
    dlq: Arc<dyn BatchWriter>,
    inserter: Arc<dyn RowInserter>,
    mapping: SinkMapping,
    settings: SinkSettings,
    health: Option<HealthHandle>,
}

impl ClickHouseSink {
    pub fn new(
        reader: Arc<dyn BatchReader>,
        dlq: Arc<dyn BatchWriter>,
        inserter: Arc<dyn RowInserter>,
        mapping: SinkMapping,
        settings: SinkSettings,
    ) -> Self {
        Self {
            name: "sink".to_string(),
            reader,
            dlq,
            inserter,
            mapping,
            settings,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    async fn ack_with_retries(&self, batch: &[Message]) {
        let mut attempt = 0;
        loop {
            match self.reader.ack(batch).await {
                Ok(()) => return,
                Err(err) if attempt < ACK_RETRIES => {
                    attempt += 1;
                    warn!(sink = %self.name, error = %err, attempt, "sink ack failed, retrying");
                    tokio::time::sleep(ACK_RETRY_DELAY).await;
                }
                Err(err) => {
                    // give up; the messages redeliver and at-least-once holds
                    warn!(sink = %self.name, error = %err, "sink ack abandoned");
                    return;
                }
            }
        }
    }

    async fn dead_letter(&self, failed: &[FailedMessage]) -> Result<(), EngineError> {
        publish_failed(self.dlq.as_ref(), failed)
            .await
            .map_err(|e| match e {
                StageFailure::Abort(err) => EngineError::operator(&self.name, err),
                StageFailure::Fatal(message) => EngineError::operator(&self.name, message),
            })
    }

    async fn fetch_and_flush(&self) -> Result<(), EngineError> {
        let batch = match self
            .reader
            .read_batch_no_wait(self.settings.max_batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(sink = %self.name, error = %err, "sink fetch failed");
                return Ok(());
            }
        };
        if batch.is_empty() {
            return Ok(());
        }
        let timer = common_metrics::timing_guard(SINK_FLUSH_TIME, &[]);

        let mut rows = Vec::with_capacity(batch.len());
        let mut insertable = Vec::with_capacity(batch.len());
        let mut row_failures = Vec::new();
        for message in &batch {
            match self.mapping.prepare_row(message.payload()) {
                Ok(row) => {
                    rows.push(row);
                    insertable.push(message.clone());
                }
                Err(err) => {
                    row_failures.push(FailedMessage::new(
                        message.clone(),
                        Role::Sink,
                        err.to_string(),
                    ));
                }
            }
        }

        // row-level failures go out first so the batch ack can cover them
        if !row_failures.is_empty() {
            self.dead_letter(&row_failures).await?;
        }

        if rows.is_empty() {
            self.ack_with_retries(&batch).await;
            timer.label("outcome", "dead-lettered").fin();
            return Ok(());
        }

        let columns = self.mapping.column_names();
        match self.inserter.insert(&columns, &rows).await {
            Ok(()) => {
                self.ack_with_retries(&batch).await;
                counter!(RECORDS_SUNK).increment(rows.len() as u64);
                debug!(sink = %self.name, rows = rows.len(), "batch inserted");
                timer.label("outcome", "inserted").fin();
                Ok(())
            }
            Err(err) => {
                counter!(SINK_INSERT_FAILURES).increment(1);
                warn!(sink = %self.name, error = %err, "insert failed, dead-lettering batch");
                let failed: Vec<FailedMessage> = insertable
                    .iter()
                    .map(|m| FailedMessage::new(m.clone(), Role::Sink, err.to_string()))
                    .collect();
                self.dead_letter(&failed).await?;
                // individual acks prevent a redelivery storm for a batch the
                // DLQ already owns
                for message in batch.iter().filter(|m| m.is_delivery()) {
                    if let Err(ack_err) = message.ack().await {
                        warn!(sink = %self.name, error = %ack_err, "post-failure ack failed");
                    }
                }
                timer.label("outcome", "failed").fin();
                Ok(())
            }
        }
    }

    async fn wait_for_size_trigger(&self) {
        loop {
            match self.reader.pending().await {
                Ok(pending) if pending >= self.settings.max_batch_size as u64 => return,
                Ok(_) => {}
                Err(err) => {
                    debug!(sink = %self.name, error = %err, "pending poll failed");
                }
            }
            tokio::time::sleep(self.settings.fetch_retry_delay).await;
        }
    }
}

#[async_trait]
impl Operator for ClickHouseSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError> {
        info!(sink = %self.name, max_batch = self.settings.max_batch_size,
            max_delay_ms = self.settings.max_delay.as_millis() as u64, "sink started");
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.max_delay,
            self.settings.max_delay,
        );

        loop {
            if let Some(health) = &self.health {
                health.report_healthy();
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.fetch_and_flush().await?;
                }
                _ = self.wait_for_size_trigger() => {
                    self.fetch_and_flush().await?;
                    ticker.reset();
                }
            }
        }

        if shutdown.mode() == StopMode::Drain {
            // one more flush on a bounded, detached deadline
            if tokio::time::timeout(self.settings.shutdown_timeout, self.fetch_and_flush())
                .await
                .is_err()
            {
                warn!(sink = %self.name, "drain flush timed out");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DlqEnvelope;
    use crate::schema::ColumnMapping;
    use common_bus::testing::{delivery, AckState, InMemoryReader, InMemoryWriter};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeInserter {
        inserts: Mutex<Vec<(Vec<String>, Vec<Map<String, Value>>)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RowInserter for FakeInserter {
        async fn insert(
            &self,
            columns: &[String],
            rows: &[Map<String, Value>],
        ) -> Result<(), EngineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Sink("connection refused".into()));
            }
            self.inserts
                .lock()
                .unwrap()
                .push((columns.to_vec(), rows.to_vec()));
            Ok(())
        }
    }

    fn mapping() -> SinkMapping {
        SinkMapping {
            columns: vec![ColumnMapping {
                column: "id".into(),
                column_type: "UInt64".into(),
                field: None,
            }],
        }
    }

    struct Fixture {
        sink: ClickHouseSink,
        reader: Arc<InMemoryReader>,
        dlq: Arc<InMemoryWriter>,
        inserter: Arc<FakeInserter>,
    }

    fn fixture() -> Fixture {
        let reader = Arc::new(InMemoryReader::new(true));
        let dlq = Arc::new(InMemoryWriter::new("gf.p1.dlq"));
        let inserter = Arc::new(FakeInserter::default());
        let sink = ClickHouseSink::new(
            reader.clone(),
            dlq.clone(),
            inserter.clone(),
            mapping(),
            SinkSettings::default(),
        );
        Fixture {
            sink,
            reader,
            dlq,
            inserter,
        }
    }

    #[tokio::test]
    async fn successful_insert_acks_the_last_message() {
        let f = fixture();
        let (m1, a1) = delivery(r#"{"id":1}"#);
        let (m2, a2) = delivery(r#"{"id":2}"#);
        f.reader.push_batch(vec![m1, m2]);

        f.sink.fetch_and_flush().await.unwrap();

        let inserts = f.inserter.inserts.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].0, vec!["id"]);
        assert_eq!(inserts[0].1.len(), 2);
        drop(inserts);

        // ack-all: acking the last covers the whole batch
        assert_eq!(a1.state(), AckState::Pending);
        assert_eq!(a2.state(), AckState::Acked);
        assert!(f.dlq.written().is_empty());
    }

    #[tokio::test]
    async fn insert_failure_dead_letters_and_acks_individually() {
        let f = fixture();
        f.inserter.fail.store(true, Ordering::SeqCst);

        let mut ackers = Vec::new();
        let batch: Vec<Message> = (0..10)
            .map(|i| {
                let (message, acker) = delivery(&format!(r#"{{"id":{i}}}"#));
                ackers.push(acker);
                message
            })
            .collect();
        f.reader.push_batch(batch);

        f.sink.fetch_and_flush().await.unwrap();

        let dead = f.dlq.written();
        assert_eq!(dead.len(), 10);
        for message in &dead {
            let envelope = DlqEnvelope::decode(message.payload()).unwrap();
            assert_eq!(envelope.role, "sink");
            assert!(envelope.error.contains("connection refused"));
        }
        for acker in &ackers {
            assert_eq!(acker.state(), AckState::Acked);
        }
    }

    #[tokio::test]
    async fn bad_rows_are_dead_lettered_and_rest_inserted() {
        let f = fixture();
        let (good, good_acker) = delivery(r#"{"id":1}"#);
        let (bad, _bad_acker) = delivery(r#"{"nope":true}"#);
        f.reader.push_batch(vec![bad, good]);

        f.sink.fetch_and_flush().await.unwrap();

        assert_eq!(f.dlq.written().len(), 1);
        let inserts = f.inserter.inserts.lock().unwrap();
        assert_eq!(inserts[0].1.len(), 1);
        drop(inserts);
        assert_eq!(good_acker.state(), AckState::Acked);
    }

    #[tokio::test]
    async fn empty_fetch_is_a_no_op() {
        let f = fixture();
        f.sink.fetch_and_flush().await.unwrap();
        assert!(f.inserter.inserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_dlq_fails_the_sink() {
        let f = fixture();
        f.inserter.fail.store(true, Ordering::SeqCst);
        f.dlq.error_writes(true);
        let (message, _) = delivery(r#"{"id":1}"#);
        f.reader.push_batch(vec![message]);

        assert!(f.sink.fetch_and_flush().await.is_err());
    }

    #[tokio::test]
    async fn drain_stop_flushes_once_more() {
        let f = fixture();
        let (message, acker) = delivery(r#"{"id":1}"#);
        f.reader.push_batch(vec![message]);

        let shutdown = ShutdownSignal::new();
        shutdown.trigger(StopMode::Drain);
        Arc::new(f.sink).run(shutdown).await.unwrap();

        assert_eq!(f.inserter.inserts.lock().unwrap().len(), 1);
        assert_eq!(acker.state(), AckState::Acked);
    }

    #[test]
    fn insert_statement_lists_columns_in_order() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let mut row = Map::new();
        row.insert("id".into(), serde_json::json!(1));
        row.insert("name".into(), serde_json::json!("a"));

        let statement = build_insert_statement("db", "events", &columns, &[row]).unwrap();
        let mut lines = statement.lines();
        assert_eq!(
            lines.next().unwrap(),
            "INSERT INTO `db`.`events` (`id`, `name`) FORMAT JSONEachRow"
        );
        assert_eq!(
            serde_json::from_str::<Value>(lines.next().unwrap()).unwrap(),
            serde_json::json!({"id": 1, "name": "a"})
        );
    }
}

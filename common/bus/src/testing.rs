//! In-memory doubles for the bus seams, used by stage and operator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;
use crate::kv::KeyStore;
use crate::message::{Acker, FailedMessage, Message, Record, Role};
use crate::reader::BatchReader;
use crate::writer::BatchWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Naked,
    Termed,
}

/// Records the first ack/nak/term it sees; later calls are no-ops, matching
/// the real delivery handles.
#[derive(Default)]
pub struct MockAcker {
    state: Mutex<Option<AckState>>,
}

impl MockAcker {
    pub fn state(&self) -> AckState {
        self.state.lock().unwrap().unwrap_or(AckState::Pending)
    }

    fn settle(&self, state: AckState) {
        let mut guard = self.state.lock().unwrap();
        if guard.is_none() {
            *guard = Some(state);
        }
    }
}

#[async_trait]
impl Acker for MockAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.settle(AckState::Acked);
        Ok(())
    }

    async fn nak(&self) -> Result<(), BusError> {
        self.settle(AckState::Naked);
        Ok(())
    }

    async fn term(&self) -> Result<(), BusError> {
        self.settle(AckState::Termed);
        Ok(())
    }
}

/// A delivery message over the given payload, plus the acker to observe.
pub fn delivery(payload: &str) -> (Message, Arc<MockAcker>) {
    let acker = Arc::new(MockAcker::default());
    let message = Message::delivery(Record::new(payload.as_bytes().to_vec()), acker.clone());
    (message, acker)
}

pub fn delivery_with_headers(
    payload: &str,
    headers: &[(&str, &str)],
) -> (Message, Arc<MockAcker>) {
    let acker = Arc::new(MockAcker::default());
    let mut record = Record::new(payload.as_bytes().to_vec());
    for (name, value) in headers {
        record.add_header(*name, *value);
    }
    (Message::delivery(record, acker.clone()), acker)
}

/// Queue-backed reader; each `read_batch` hands out the next queued batch.
#[derive(Default)]
pub struct InMemoryReader {
    batches: Mutex<VecDeque<Vec<Message>>>,
    ack_all: bool,
    fail_reads: AtomicBool,
}

impl InMemoryReader {
    pub fn new(ack_all: bool) -> Self {
        Self {
            ack_all,
            ..Default::default()
        }
    }

    pub fn push_batch(&self, batch: Vec<Message>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn pop(&self, max: usize) -> Vec<Message> {
        let mut batches = self.batches.lock().unwrap();
        match batches.pop_front() {
            Some(mut batch) => {
                if batch.len() > max {
                    let rest = batch.split_off(max);
                    batches.push_front(rest);
                }
                batch
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl BatchReader for InMemoryReader {
    async fn read_batch(&self, max: usize, _wait: Duration) -> Result<Vec<Message>, BusError> {
        self.read_batch_no_wait(max).await
    }

    async fn read_batch_no_wait(&self, max: usize) -> Result<Vec<Message>, BusError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BusError::Fetch("injected read failure".into()));
        }
        Ok(self.pop(max))
    }

    async fn pending(&self) -> Result<u64, BusError> {
        let batches = self.batches.lock().unwrap();
        Ok(batches.iter().map(|b| b.len() as u64).sum())
    }

    async fn ack(&self, batch: &[Message]) -> Result<(), BusError> {
        if self.ack_all {
            if let Some(last) = batch.iter().rev().find(|m| m.is_delivery()) {
                last.ack().await?;
            }
            return Ok(());
        }
        for message in batch.iter().filter(|m| m.is_delivery()) {
            message.ack().await?;
        }
        Ok(())
    }

    async fn nak(&self, batch: &[Message]) -> Result<(), BusError> {
        for message in batch.iter().filter(|m| m.is_delivery()) {
            message.nak().await?;
        }
        Ok(())
    }
}

/// Captures written batches; failure modes are injectable per writer.
pub struct InMemoryWriter {
    subject: String,
    written: Mutex<Vec<Message>>,
    reject_all: AtomicBool,
    error_writes: AtomicBool,
}

impl InMemoryWriter {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            written: Mutex::new(Vec::new()),
            reject_all: AtomicBool::new(false),
            error_writes: AtomicBool::new(false),
        }
    }

    /// Every subsequent write reports all messages as broker-rejected.
    pub fn reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Every subsequent write fails outright.
    pub fn error_writes(&self, error: bool) {
        self.error_writes.store(error, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<Message> {
        self.written.lock().unwrap().clone()
    }

    pub fn written_payloads(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
            .collect()
    }
}

#[async_trait]
impl BatchWriter for InMemoryWriter {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn write_batch(&self, messages: &[Message]) -> Result<Vec<FailedMessage>, BusError> {
        if self.error_writes.load(Ordering::SeqCst) {
            return Err(BusError::Publish("injected write failure".into()));
        }
        if self.reject_all.load(Ordering::SeqCst) {
            return Ok(messages
                .iter()
                .map(|m| {
                    FailedMessage::new(m.clone(), Role::BatchWriter, "injected broker reject")
                })
                .collect());
        }
        self.written.lock().unwrap().extend(messages.iter().cloned());
        Ok(Vec::new())
    }
}

/// Hash-map key store. TTL expiry is simulated with [`InMemoryKeyStore::expire`].
#[derive(Default)]
pub struct InMemoryKeyStore {
    entries: Mutex<HashMap<String, Bytes>>,
    fail_ops: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_ops(&self, fail: bool) {
        self.fail_ops.store(fail, Ordering::SeqCst);
    }

    /// Fail writes (put/delete) while reads keep working.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drop an entry as if its TTL elapsed.
    pub fn expire(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), BusError> {
        if self.fail_ops.load(Ordering::SeqCst) {
            return Err(BusError::Kv("injected kv failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), BusError> {
        self.check()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BusError::Kv("injected kv write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BusError> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), BusError> {
        self.check_write()?;
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<bool, BusError> {
        self.check_write()?;
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.check_write()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

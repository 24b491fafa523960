use std::collections::VecDeque;
use std::time::Duration;

use async_nats::jetstream::{self, context::PublishAckFuture};
use async_nats::HeaderMap;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::message::{FailedMessage, Message, Role};

const PUBLISH_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Publish-side seam. `write_batch` returns the messages whose broker ack
/// failed; the caller decides whether those go to the DLQ.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    fn subject(&self) -> &str;

    async fn write_batch(&self, messages: &[Message]) -> Result<Vec<FailedMessage>, BusError>;
}

/// Async publisher with an in-flight cap. Publishes are enqueued in order;
/// once the cap is reached the writer waits on the oldest outstanding ack
/// before enqueueing more, so writes block rather than error under
/// back-pressure. Enqueue failures are retried with exponential backoff
/// bounded by `max_retry_wait` before the batch is abandoned.
pub struct JetStreamWriter {
    jetstream: jetstream::Context,
    subject: String,
    max_pending_acks: usize,
    max_retry_wait: Duration,
}

impl JetStreamWriter {
    pub fn new(
        jetstream: jetstream::Context,
        subject: impl Into<String>,
        max_pending_acks: usize,
        max_retry_wait: Duration,
    ) -> Self {
        Self {
            jetstream,
            subject: subject.into(),
            max_pending_acks: max_pending_acks.max(1),
            max_retry_wait,
        }
    }

    fn header_map(message: &Message) -> Option<HeaderMap> {
        let headers = message.record().headers();
        if headers.is_empty() {
            return None;
        }
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.as_str(), value.as_str());
        }
        Some(map)
    }

    async fn publish_with_retry(&self, message: &Message) -> Result<PublishAckFuture, BusError> {
        let payload = message.payload().clone();
        let mut backoff = PUBLISH_INITIAL_BACKOFF;
        let mut waited = Duration::ZERO;

        loop {
            let result = match Self::header_map(message) {
                Some(headers) => {
                    self.jetstream
                        .publish_with_headers(self.subject.clone(), headers, payload.clone())
                        .await
                }
                None => self.jetstream.publish(self.subject.clone(), payload.clone()).await,
            };
            match result {
                Ok(ack) => return Ok(ack),
                Err(err) => {
                    if waited >= self.max_retry_wait {
                        return Err(BusError::publish(err));
                    }
                    debug!(subject = %self.subject, error = %err,
                        backoff_ms = backoff.as_millis() as u64, "publish enqueue failed, retrying");
                    sleep(backoff).await;
                    waited += backoff;
                    backoff = (backoff * 2).min(self.max_retry_wait);
                }
            }
        }
    }
}

#[async_trait]
impl BatchWriter for JetStreamWriter {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn write_batch(&self, messages: &[Message]) -> Result<Vec<FailedMessage>, BusError> {
        let mut in_flight: VecDeque<(usize, PublishAckFuture)> =
            VecDeque::with_capacity(self.max_pending_acks.min(messages.len()));
        let mut failed = Vec::new();

        for (index, message) in messages.iter().enumerate() {
            while in_flight.len() >= self.max_pending_acks {
                let (settled_index, ack) = in_flight.pop_front().expect("in_flight is non-empty");
                if let Err(err) = ack.await {
                    warn!(subject = %self.subject, error = %err, "broker rejected publish");
                    failed.push(FailedMessage::new(
                        messages[settled_index].clone(),
                        Role::BatchWriter,
                        err.to_string(),
                    ));
                }
            }

            let ack = self.publish_with_retry(message).await?;
            in_flight.push_back((index, ack));
        }

        // Harvest the remaining acks; only broker-rejected messages are
        // reported, the rest are durably stored.
        for (index, ack) in in_flight {
            if let Err(err) = ack.await {
                warn!(subject = %self.subject, error = %err, "broker rejected publish");
                failed.push(FailedMessage::new(
                    messages[index].clone(),
                    Role::BatchWriter,
                    err.to_string(),
                ));
            }
        }

        metrics::counter!("bus_messages_published_total", "subject" => self.subject.clone())
            .increment((messages.len() - failed.len()) as u64);
        if !failed.is_empty() {
            metrics::counter!("bus_publish_failures_total", "subject" => self.subject.clone())
                .increment(failed.len() as u64);
        }

        Ok(failed)
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::PullConsumer;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::message::Message;

/// Pull-side view of a durable consumer: batch reads with and without a
/// wait, the pending count, and acknowledgment over message slices. Stage
/// logic is written against this trait so it can run on the in-memory fakes
/// in tests.
#[async_trait]
pub trait BatchReader: Send + Sync {
    /// Read up to `max` messages, waiting at most `wait` for the first.
    async fn read_batch(&self, max: usize, wait: Duration) -> Result<Vec<Message>, BusError>;

    /// Read whatever is immediately available, up to `max`.
    async fn read_batch_no_wait(&self, max: usize) -> Result<Vec<Message>, BusError>;

    /// Number of messages the consumer has not yet delivered.
    async fn pending(&self) -> Result<u64, BusError>;

    /// Acknowledge a batch. Under ack-all policy only the last delivery is
    /// acked, which implicitly covers the rest.
    async fn ack(&self, batch: &[Message]) -> Result<(), BusError>;

    /// Negatively acknowledge each delivery for prompt redelivery.
    async fn nak(&self, batch: &[Message]) -> Result<(), BusError>;
}

pub struct JetStreamReader {
    consumer: PullConsumer,
    ack_all: bool,
}

impl JetStreamReader {
    pub fn new(consumer: PullConsumer, ack_all: bool) -> Self {
        Self { consumer, ack_all }
    }

    async fn drain_batch(
        mut batch: async_nats::jetstream::consumer::pull::Batch,
        max: usize,
    ) -> Result<Vec<Message>, BusError> {
        let mut messages = Vec::with_capacity(max);
        while let Some(message) = batch.next().await {
            // A partial failure mid-fetch aborts the whole batch with the
            // observed error; unacked messages redeliver after ack-wait.
            let message = message.map_err(BusError::Fetch)?;
            messages.push(Message::from_jetstream(message));
        }
        Ok(messages)
    }
}

#[async_trait]
impl BatchReader for JetStreamReader {
    async fn read_batch(&self, max: usize, wait: Duration) -> Result<Vec<Message>, BusError> {
        let batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(BusError::fetch)?;
        Self::drain_batch(batch, max).await
    }

    async fn read_batch_no_wait(&self, max: usize) -> Result<Vec<Message>, BusError> {
        let batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(BusError::fetch)?;
        Self::drain_batch(batch, max).await
    }

    async fn pending(&self) -> Result<u64, BusError> {
        let mut consumer = self.consumer.clone();
        let info = consumer.info().await.map_err(BusError::fetch)?;
        Ok(info.num_pending)
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

/// Handle over a push-style consume loop: `stop` cancels the loop, `done`
/// resolves once the in-flight handler finishes and the loop exits.
pub struct ConsumeContext {
    token: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl ConsumeContext {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn done(self) {
        let _ = self.done.await;
    }
}

/// Push-based consumption built on batch pulls: the handler runs for every
/// message, one at a time, until the context is stopped.
pub fn consume<R, F, Fut>(
    reader: Arc<R>,
    pull_max: usize,
    pull_expiry: Duration,
    mut handler: F,
) -> ConsumeContext
where
    R: BatchReader + ?Sized + 'static,
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = loop_token.cancelled() => break,
                batch = reader.read_batch(pull_max, pull_expiry) => batch,
            };
            match batch {
                Ok(messages) => {
                    for message in messages {
                        handler(message).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "consume pull failed, backing off");
                    tokio::select! {
                        _ = loop_token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!("consume loop closed");
        let _ = done_tx.send(());
    });

    ConsumeContext {
        token,
        done: done_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{delivery, AckState, InMemoryReader};
    use std::sync::Mutex;

    #[tokio::test]
    async fn consume_runs_the_handler_until_stopped() {
        let reader = Arc::new(InMemoryReader::new(false));
        let (m1, a1) = delivery(r#"{"n":1}"#);
        let (m2, a2) = delivery(r#"{"n":2}"#);
        reader.push_batch(vec![m1]);
        reader.push_batch(vec![m2]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let context = consume(
            reader,
            10,
            Duration::from_millis(1),
            move |message: Message| {
                let seen = seen_in_handler.clone();
                async move {
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(message.payload()).into_owned());
                    drop(message.ack().await);
                }
            },
        );

        // both queued batches drain through the handler
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if seen.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler did not observe both messages");

        context.stop();
        context.done().await;

        assert_eq!(*seen.lock().unwrap(), vec![r#"{"n":1}"#, r#"{"n":2}"#]);
        assert_eq!(a1.state(), AckState::Acked);
        assert_eq!(a2.state(), AckState::Acked);
    }
}

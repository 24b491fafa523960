use std::time::Duration;

use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Error taxonomy for bus operations.
///
/// Transient variants are retried by callers with bounded backoff; the rest
/// abort the operation. `StreamNotFound` is typed so the DLQ client can
/// distinguish an absent pipeline from a broken broker.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to bus at {url}: {source}")]
    Connect { url: String, source: Source },

    #[error("gave up connecting to bus at {url} after {attempts} attempts ({budget:?})")]
    ConnectBudgetExhausted {
        url: String,
        attempts: u32,
        budget: Duration,
    },

    #[error("stream {0} not found")]
    StreamNotFound(String),

    #[error("stream setup failed: {0}")]
    StreamSetup(Source),

    #[error("consumer setup failed: {0}")]
    ConsumerSetup(Source),

    #[error("kv bucket setup failed: {0}")]
    KvSetup(Source),

    #[error("kv operation failed: {0}")]
    Kv(Source),

    #[error("fetch failed: {0}")]
    Fetch(Source),

    #[error("publish failed: {0}")]
    Publish(Source),

    #[error("ack failed: {0}")]
    Ack(Source),

    #[error("acknowledgment is only valid on bus deliveries")]
    NotADelivery,

    #[error("bus operation timed out after {0:?}")]
    Timeout(Duration),
}

impl BusError {
    pub fn stream_setup(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::StreamSetup(Box::new(err))
    }

    pub fn consumer_setup(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::ConsumerSetup(Box::new(err))
    }

    pub fn kv_setup(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::KvSetup(Box::new(err))
    }

    pub fn kv(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::Kv(Box::new(err))
    }

    pub fn fetch(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::Fetch(Box::new(err))
    }

    pub fn publish(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::Publish(Box::new(err))
    }

    pub fn ack(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BusError::Ack(Box::new(err))
    }
}

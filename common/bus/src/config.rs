use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct BusConfig {
    #[envconfig(from = "GF_NATS_SERVER", default = "nats://localhost:4222")]
    pub nats_server: String,

    // Total budget for the initial connection, spread over backoff attempts
    #[envconfig(from = "GF_NATS_MAX_CONNECTION_WAIT_SECONDS", default = "30")]
    pub nats_max_connection_wait_seconds: u64,

    #[envconfig(from = "GF_NATS_CLEANUP_TIMEOUT_SECONDS", default = "30")]
    pub nats_cleanup_timeout_seconds: u64,

    // Cap on un-acked async publishes per writer; writes throttle, not fail,
    // when the cap is reached
    #[envconfig(from = "GF_PUBLISHER_MAX_PENDING_ACKS", default = "1000")]
    pub publisher_max_pending_acks: usize,

    #[envconfig(from = "GF_PUBLISHER_ASYNC_MAX_RETRY_WAIT_MS", default = "5000")]
    pub publisher_async_max_retry_wait_ms: u64,
}

impl BusConfig {
    pub fn max_connection_wait(&self) -> Duration {
        Duration::from_secs(self.nats_max_connection_wait_seconds)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.nats_cleanup_timeout_seconds)
    }

    pub fn publisher_max_retry_wait(&self) -> Duration {
        Duration::from_millis(self.publisher_async_max_retry_wait_ms)
    }
}

//! Operator lifecycle: a pipeline is a fixed set of operators started in
//! dependency order and stopped as a set, either draining in-flight work or
//! cancelling it outright.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the in-flight batch, flush what is pending, then exit.
    Drain,
    /// Cancel immediately; unacked messages redeliver after ack-wait.
    NoWait,
}

const MODE_RUNNING: u8 = 0;
const MODE_DRAIN: u8 = 1;
const MODE_NO_WAIT: u8 = 2;

/// Cancellation shared by every operator of one pipeline. The stop mode is
/// latched before the token fires so operators observe a consistent mode.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    mode: Arc<AtomicU8>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            mode: Arc::new(AtomicU8::new(MODE_RUNNING)),
        }
    }

    pub fn trigger(&self, mode: StopMode) {
        let value = match mode {
            StopMode::Drain => MODE_DRAIN,
            StopMode::NoWait => MODE_NO_WAIT,
        };
        // first trigger wins; a later no-wait upgrade is still honored
        let _ = self
            .mode
            .compare_exchange(MODE_RUNNING, value, Ordering::SeqCst, Ordering::SeqCst);
        if mode == StopMode::NoWait {
            self.mode.store(MODE_NO_WAIT, Ordering::SeqCst);
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The stop mode, meaningful once the signal fired. Defaults to drain.
    pub fn mode(&self) -> StopMode {
        match self.mode.load(Ordering::SeqCst) {
            MODE_NO_WAIT => StopMode::NoWait,
            _ => StopMode::Drain,
        }
    }
}

/// One long-running pipeline task with a start/stop contract. `run` returns
/// when the shutdown signal fires (clean stop) or on a fatal error.
#[async_trait]
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError>;
}

/// Starts operators, shares one error channel, and stops the set on the
/// first failure or an external stop.
pub struct Supervisor {
    shutdown: ShutdownSignal,
    handles: Vec<(String, JoinHandle<()>)>,
    err_tx: mpsc::Sender<EngineError>,
    err_rx: mpsc::Receiver<EngineError>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(stop_timeout: Duration) -> Self {
        let (err_tx, err_rx) = mpsc::channel(16);
        Self {
            shutdown: ShutdownSignal::new(),
            handles: Vec::new(),
            err_tx,
            err_rx,
            stop_timeout,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn an operator task. Callers spawn in dependency order: sink
    /// first, then the processing component, then ingestors and join.
    pub fn spawn(&mut self, operator: Arc<dyn Operator>) {
        let name = operator.name().to_string();
        let shutdown = self.shutdown.clone();
        let err_tx = self.err_tx.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!(operator = %task_name, "operator started");
            match operator.run(shutdown).await {
                Ok(()) => info!(operator = %task_name, "operator stopped"),
                Err(err) => {
                    error!(operator = %task_name, error = %err, "operator failed");
                    drop(
                        err_tx
                            .send(EngineError::operator(task_name.clone(), err))
                            .await,
                    );
                }
            }
        });
        self.handles.push((name, handle));
    }

    /// Resolve on the first operator failure. Returns `None` once the
    /// supervisor is stopping and the channel drains empty.
    pub async fn wait_for_failure(&mut self) -> Option<EngineError> {
        tokio::select! {
            err = self.err_rx.recv() => err,
            _ = self.shutdown.cancelled() => None,
        }
    }

    /// Stop every operator and await their exit within the stop timeout.
    /// The first failure observed (from the error channel or a panicked
    /// task) is returned.
    pub async fn stop(mut self, mode: StopMode) -> Result<(), EngineError> {
        self.shutdown.trigger(mode);

        let mut first_error = None;
        for (name, handle) in self.handles.drain(..) {
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(operator = %name, error = %join_err, "operator task panicked");
                    first_error.get_or_insert(EngineError::operator(&name, join_err));
                }
                Err(_) => {
                    warn!(operator = %name, timeout = ?self.stop_timeout,
                        "operator did not stop in time");
                    first_error
                        .get_or_insert(EngineError::operator(&name, "shutdown timeout"));
                }
            }
        }

        // surface any failure the operators reported while stopping
        if let Ok(err) = self.err_rx.try_recv() {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct LoopingOperator {
        name: String,
        drained: AtomicBool,
        fail: bool,
    }

    impl LoopingOperator {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                drained: AtomicBool::new(false),
                fail,
            })
        }
    }

    #[async_trait]
    impl Operator for LoopingOperator {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::Config("boom".into()));
            }
            shutdown.cancelled().await;
            if shutdown.mode() == StopMode::Drain {
                self.drained.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn drain_stop_lets_operators_flush() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        let operator = LoopingOperator::new("sink", false);
        supervisor.spawn(operator.clone());

        supervisor.stop(StopMode::Drain).await.unwrap();
        assert!(operator.drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_wait_stop_skips_draining() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        let operator = LoopingOperator::new("sink", false);
        supervisor.spawn(operator.clone());

        supervisor.stop(StopMode::NoWait).await.unwrap();
        assert!(!operator.drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn first_failure_is_surfaced() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        supervisor.spawn(LoopingOperator::new("ok", false));
        supervisor.spawn(LoopingOperator::new("broken", true));

        let failure = supervisor.wait_for_failure().await;
        assert!(matches!(failure, Some(EngineError::Operator { .. })));

        supervisor.stop(StopMode::NoWait).await.unwrap();
    }

    #[test]
    fn mode_defaults_to_drain_and_upgrades_to_no_wait() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.mode(), StopMode::Drain);

        signal.trigger(StopMode::Drain);
        assert_eq!(signal.mode(), StopMode::Drain);

        signal.trigger(StopMode::NoWait);
        assert_eq!(signal.mode(), StopMode::NoWait);
        assert!(signal.is_cancelled());
    }
}

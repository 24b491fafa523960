//! The per-record stages between ingest and sink: a small ordered chain of
//! processors run by the component's read-process-write loop.

pub mod component;
pub mod concurrent;
pub mod dedup;
pub mod dlq;
pub mod filter;
pub mod transform;

pub use component::{Component, ComponentSettings};
pub use concurrent::ConcurrentProcessor;
pub use dedup::{DedupProcessor, Deduplicator};
pub use dlq::DlqMiddleware;
pub use filter::FilterProcessor;
pub use transform::TransformProcessor;

use async_trait::async_trait;
use common_bus::{FailedMessage, Message, Role};
use futures::future::BoxFuture;

use crate::error::FatalError;

/// Deferred stage-local side effect, run after the downstream write succeeds
/// and before the input batch is acked.
pub type CommitFn = BoxFuture<'static, Result<(), FatalError>>;

/// How a stage failed a whole batch.
#[derive(Debug)]
pub enum StageFailure {
    /// The batch cannot proceed; the component naks the input and the bus
    /// redelivers it.
    Abort(FatalError),
    /// The pipeline cannot continue (e.g. the DLQ is unwritable); the
    /// operator exits and the supervisor stops the rest.
    Fatal(String),
}

impl From<FatalError> for StageFailure {
    fn from(err: FatalError) -> Self {
        StageFailure::Abort(err)
    }
}

/// A batch moving through the processor chain. Processors may shrink
/// `messages`, append to `failed`, and attach commit steps.
pub struct ProcessorBatch {
    pub messages: Vec<Message>,
    pub failed: Vec<FailedMessage>,
    pub commits: Vec<CommitFn>,
}

impl ProcessorBatch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            failed: Vec::new(),
            commits: Vec::new(),
        }
    }
}

/// One stage of the chain, polymorphic over `process` and `close`.
#[async_trait]
pub trait Processor: Send + Sync {
    fn role(&self) -> Role;

    async fn process(&self, batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure>;

    async fn close(&self) {}
}

/// Run the chain in order; the first failure short-circuits.
pub async fn run_chain(
    processors: &[Box<dyn Processor>],
    mut batch: ProcessorBatch,
) -> Result<ProcessorBatch, StageFailure> {
    for processor in processors {
        batch = processor.process(batch).await?;
    }
    Ok(batch)
}

use common_bus::BusError;
use thiserror::Error;

/// A batch-level failure inside a stage. Fatal errors abort the batch; the
/// component naks the input so the bus redelivers it.
#[derive(Debug, Error)]
#[error("fatal stage error: {0}")]
pub struct FatalError(pub String);

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        FatalError(message.into())
    }
}

impl From<BusError> for FatalError {
    fn from(err: BusError) -> Self {
        FatalError(err.to_string())
    }
}

/// Operator-level errors, surfaced on the supervisor's error channel. Any of
/// these stops the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operator {operator} failed: {message}")]
    Operator { operator: String, message: String },
}

impl EngineError {
    pub fn operator(operator: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::Operator {
            operator: operator.into(),
            message: message.to_string(),
        }
    }
}

use std::sync::Arc;

/// Errors that can occur while deduplicating a call
///
/// Every caller attached to one execution receives a clone of the same
/// error, so the operation's own error is shared behind an `Arc`.
#[derive(Debug, thiserror::Error)]
pub enum DedupeError<E> {
    #[error("Call parameters could not be serialized: {0}")]
    Serialization(Arc<serde_json::Error>),
    #[error("Call failed: {0}")]
    Failed(Arc<E>),
    #[error("Deduplicator was cleaned up")]
    Cleaned,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// Manual impl: a derive would demand `E: Clone`
impl<E> Clone for DedupeError<E> {
    fn clone(&self) -> Self {
        match self {
            DedupeError::Serialization(error) => DedupeError::Serialization(error.clone()),
            DedupeError::Failed(error) => DedupeError::Failed(error.clone()),
            DedupeError::Cleaned => DedupeError::Cleaned,
            DedupeError::Executor(error) => DedupeError::Executor(*error),
        }
    }
}

impl<E> From<serde_json::Error> for DedupeError<E> {
    fn from(error: serde_json::Error) -> Self {
        DedupeError::Serialization(Arc::new(error))
    }
}

/// Errors raised by the rate-limited executor itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Dispatched call panicked")]
    Panicked,
    #[error("Dispatched call was cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for ExecutorError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            ExecutorError::Panicked
        } else {
            ExecutorError::Cancelled
        }
    }
}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Load(Box::new(error))
    }
}

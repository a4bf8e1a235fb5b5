use crate::domain::attempt::AttemptState;
use crate::domain::payment::TransactionType;
use crate::domain::ports::ProcessorError;
use crate::application::state_machine::OperationResult;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Missing plugin property {0}")]
    MissingProperty(&'static str),
    #[error("Control plugin {plugin} failed: {message}")]
    PluginError { plugin: String, message: String },
    #[error("Payment processor error: {0}")]
    ProcessorError(#[from] ProcessorError),
    #[error("Transaction type {0} is not supported by the control state machine")]
    UnsupportedTransactionType(TransactionType),
    #[error("No transition from state {from} on {event}")]
    InvalidTransition {
        from: AttemptState,
        event: OperationResult,
    },
    #[error("Attempt {0} not found")]
    AttemptNotFound(Uuid),
    #[error("Attempt {attempt_id} is in state {state} and cannot be retried")]
    NotRetryable { attempt_id: Uuid, state: AttemptState },
    #[error("Timed out acquiring the lock for account {0}")]
    LockTimeout(Uuid),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    /// Infrastructure failures are never retried by the core.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::time::Duration;
use thiserror::Error;

/// Error codes the queue service uses for conditions that clear up on their own.
const TRANSIENT_SERVICE_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "KmsThrottled",
];

/// Error codes the queue service returns when a queue name or URL does not resolve.
const MISSING_QUEUE_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    #[error("Service error: {code} - {message}")]
    Service { code: String, message: String },

    #[error("Queue does not exist: {0}")]
    QueueNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max: 262144)")]
    MessageTooLarge { size: usize },
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Connection(_) | QueueError::Timeout(_) => true,
            QueueError::Service { code, .. } => TRANSIENT_SERVICE_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Converts an SDK failure into a [`QueueError`].
    ///
    /// `timeout` is the client's configured operation timeout, reported back
    /// when the SDK gives up waiting.
    pub(crate) fn from_sdk<E, R>(err: SdkError<E, R>, timeout: Duration) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) => QueueError::Timeout(timeout.as_millis() as u64),
            SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                QueueError::Connection(DisplayErrorContext(&err).to_string())
            }
            SdkError::ConstructionFailure(_) => {
                QueueError::Validation(DisplayErrorContext(&err).to_string())
            }
            _ => {
                let code = err.code().unwrap_or("Unknown").to_string();
                let message = err
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

                if MISSING_QUEUE_CODES.contains(&code.as_str()) {
                    QueueError::QueueNotFound(message)
                } else {
                    QueueError::Service { code, message }
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Largest message body the queue service accepts (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Longest delivery delay the queue service accepts, in seconds.
pub const MAX_DELAY_SECONDS: i32 = 900;

/// Most messages a single receive call may return.
pub const MAX_RECEIVE_BATCH: i32 = 10;

/// Longest long-poll wait the queue service accepts, in seconds.
pub const MAX_WAIT_TIME_SECONDS: i32 = 20;

/// Longest visibility timeout the queue service accepts (12 hours), in seconds.
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

/// A single delivery of a message, as handed out by a receive call.
///
/// The `receipt_handle` identifies this delivery only. A later receive of the
/// same message carries a different handle, and only the latest one can be
/// used to delete it.
///
/// # Examples
///
/// ```
/// use sqs_longpoll::ReceivedMessage;
///
/// let message = ReceivedMessage {
///     message_id: "5fea7756-0ea4-451a-a703-a558b933e274".to_string(),
///     body: "Transaction id: 299 last batch".to_string(),
///     receipt_handle: "AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a".to_string(),
/// };
/// assert!(message.is_last_batch());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Identifier assigned by the service when the message was sent
    pub message_id: String,
    /// The message content
    pub body: String,
    /// One-time token needed to delete this delivery
    pub receipt_handle: String,
}

impl ReceivedMessage {
    /// Whether the producer tagged this message as part of its final batch.
    pub fn is_last_batch(&self) -> bool {
        self.body.ends_with(LAST_BATCH_SUFFIX)
    }
}

/// Suffix the producer appends to messages in its final batch.
pub const LAST_BATCH_SUFFIX: &str = " last batch";

/// A message waiting to be sent.
///
/// Standard queues accept a per-message `delay_seconds`. FIFO queues reject a
/// per-message delay and instead require a `message_group_id`; the
/// `deduplication_id` can be omitted when the queue has content-based
/// deduplication turned on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub delay_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_id: Option<String>,
}

impl OutgoingMessage {
    /// Creates a message for a standard queue with no delay.
    ///
    /// ```
    /// use sqs_longpoll::OutgoingMessage;
    ///
    /// let message = OutgoingMessage::new("Transaction id: 7").with_delay(1);
    /// assert_eq!(message.delay_seconds, Some(1));
    /// assert!(message.message_group_id.is_none());
    /// ```
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            delay_seconds: None,
            message_group_id: None,
            deduplication_id: None,
        }
    }

    pub fn with_delay(mut self, seconds: i32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }

    /// Assigns a fresh time-ordered deduplication id.
    pub fn with_generated_deduplication_id(self) -> Self {
        self.with_deduplication_id(Uuid::now_v7().to_string())
    }

    pub fn is_fifo(&self) -> bool {
        self.message_group_id.is_some()
    }

    /// Checks the message against the service's limits before it goes on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.body.is_empty() {
            return Err(QueueError::Validation(
                "Message body must not be empty".to_string(),
            ));
        }

        if self.body.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: self.body.len(),
            });
        }

        if let Some(delay) = self.delay_seconds {
            if !(0..=MAX_DELAY_SECONDS).contains(&delay) {
                return Err(QueueError::Validation(format!(
                    "Delay must be between 0 and {MAX_DELAY_SECONDS} seconds, got {delay}"
                )));
            }
        }

        if self.deduplication_id.is_some() && self.message_group_id.is_none() {
            return Err(QueueError::Validation(
                "Deduplication id requires a message group id".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parameters for a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned (1..=10)
    pub max_messages: i32,
    /// Long-poll wait in seconds (0 means short polling); `None` defers to the
    /// queue's `ReceiveMessageWaitTimeSeconds` attribute
    pub wait_time_seconds: Option<i32>,
    /// Overrides the queue's visibility timeout for the returned deliveries
    pub visibility_timeout: Option<i32>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time_seconds: Some(MAX_WAIT_TIME_SECONDS),
            visibility_timeout: None,
        }
    }
}

impl ReceiveOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_RECEIVE_BATCH).contains(&self.max_messages) {
            return Err(QueueError::Validation(format!(
                "Max messages must be between 1 and {MAX_RECEIVE_BATCH}, got {}",
                self.max_messages
            )));
        }

        if let Some(wait) = self.wait_time_seconds {
            if !(0..=MAX_WAIT_TIME_SECONDS).contains(&wait) {
                return Err(QueueError::Validation(format!(
                    "Wait time must be between 0 and {MAX_WAIT_TIME_SECONDS} seconds, got {wait}"
                )));
            }
        }

        if let Some(visibility) = self.visibility_timeout {
            if !(0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&visibility) {
                return Err(QueueError::Validation(format!(
                    "Visibility timeout must be between 0 and {MAX_VISIBILITY_TIMEOUT_SECONDS} seconds, got {visibility}"
                )));
            }
        }

        Ok(())
    }
}

//! The operations the producer and consumer need from a queue service.
//!
//! [`QueueApi`] is implemented by [`SqsClient`](crate::SqsClient) for the real
//! service and by [`MemoryQueueService`](crate::MemoryQueueService) for tests
//! and offline runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{QueueError, Result};
use crate::message::{
    OutgoingMessage, ReceiveOptions, ReceivedMessage, MAX_VISIBILITY_TIMEOUT_SECONDS,
    MAX_WAIT_TIME_SECONDS,
};

pub const RECEIVE_MESSAGE_WAIT_TIME_SECONDS: &str = "ReceiveMessageWaitTimeSeconds";
pub const VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
pub const FIFO_QUEUE: &str = "FifoQueue";
pub const CONTENT_BASED_DEDUPLICATION: &str = "ContentBasedDeduplication";

/// Scalar queue attributes the producer and consumer manage.
///
/// Unset fields are left untouched on the service side.
///
/// ```
/// use sqs_longpoll::QueueAttributes;
///
/// let attributes = QueueAttributes::long_polling(20).with_visibility_timeout(5);
/// let map = attributes.mutable_attributes();
/// assert_eq!(map["ReceiveMessageWaitTimeSeconds"], "20");
/// assert_eq!(map["VisibilityTimeout"], "5");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    pub receive_wait_time_seconds: Option<i32>,
    pub visibility_timeout_seconds: Option<i32>,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
}

impl QueueAttributes {
    /// Attributes that make every receive on the queue a long poll.
    pub fn long_polling(wait_time_seconds: i32) -> Self {
        Self {
            receive_wait_time_seconds: Some(wait_time_seconds),
            ..Default::default()
        }
    }

    /// A FIFO queue that deduplicates on a hash of the message body.
    pub fn fifo() -> Self {
        Self {
            fifo_queue: true,
            content_based_deduplication: true,
            ..Default::default()
        }
    }

    pub fn with_visibility_timeout(mut self, seconds: i32) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(wait) = self.receive_wait_time_seconds {
            if !(0..=MAX_WAIT_TIME_SECONDS).contains(&wait) {
                return Err(QueueError::Validation(format!(
                    "{RECEIVE_MESSAGE_WAIT_TIME_SECONDS} must be between 0 and {MAX_WAIT_TIME_SECONDS}, got {wait}"
                )));
            }
        }

        if let Some(visibility) = self.visibility_timeout_seconds {
            if !(0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&visibility) {
                return Err(QueueError::Validation(format!(
                    "{VISIBILITY_TIMEOUT} must be between 0 and {MAX_VISIBILITY_TIMEOUT_SECONDS}, got {visibility}"
                )));
            }
        }

        if self.content_based_deduplication && !self.fifo_queue {
            return Err(QueueError::Validation(format!(
                "{CONTENT_BASED_DEDUPLICATION} is only valid on FIFO queues"
            )));
        }

        Ok(())
    }

    /// Attributes accepted when the queue is created.
    pub fn creation_attributes(&self) -> BTreeMap<&'static str, String> {
        let mut map = self.mutable_attributes();
        if self.fifo_queue {
            map.insert(FIFO_QUEUE, "true".to_string());
        }
        map
    }

    /// Attributes that can be changed on an existing queue.
    ///
    /// `FifoQueue` is fixed at creation and never appears here.
    pub fn mutable_attributes(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        if let Some(wait) = self.receive_wait_time_seconds {
            map.insert(RECEIVE_MESSAGE_WAIT_TIME_SECONDS, wait.to_string());
        }
        if let Some(visibility) = self.visibility_timeout_seconds {
            map.insert(VISIBILITY_TIMEOUT, visibility.to_string());
        }
        if self.fifo_queue {
            map.insert(
                CONTENT_BASED_DEDUPLICATION,
                self.content_based_deduplication.to_string(),
            );
        }
        map
    }
}

/// A managed message queue, reduced to the calls the producer and consumer make.
///
/// Every method is one round trip. Delivery guarantees, ordering and
/// visibility timeouts are whatever the implementation provides.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Creates the queue if it does not exist and returns its URL.
    async fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<String>;

    /// Resolves a queue name to its URL.
    ///
    /// Returns [`QueueError::QueueNotFound`] when no such queue exists.
    async fn get_queue_url(&self, name: &str) -> Result<String>;

    async fn set_queue_attributes(&self, queue_url: &str, attributes: &QueueAttributes)
        -> Result<()>;

    /// Fetches every attribute of the queue as name/value strings.
    async fn get_queue_attributes(&self, queue_url: &str) -> Result<BTreeMap<String, String>>;

    /// Sends one message and returns the id the service assigned to it.
    async fn send_message(&self, queue_url: &str, message: &OutgoingMessage) -> Result<String>;

    /// Receives up to `options.max_messages` messages, waiting for the
    /// long-poll interval when the queue is empty.
    async fn receive_messages(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledges a delivery so it is never handed out again.
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    /// Returns the URL of `name`, creating the queue first when `create` is set.
    async fn resolve_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
        create: bool,
    ) -> Result<String> {
        if create {
            self.create_queue(name, attributes).await
        } else {
            self.get_queue_url(name).await
        }
    }
}

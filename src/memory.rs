//! In-process queue service for tests and offline runs.
//!
//! Behaves like the managed service where a producer or consumer can observe it:
//! - a delivered message stays hidden for the visibility timeout, then
//!   reappears with a new receipt handle unless it was deleted;
//! - receives long-poll up to the requested (or queue default) wait time and
//!   wake as soon as a message is sent;
//! - per-message delays hold a message back before its first delivery;
//! - FIFO queues require a group id, reject per-message delays and drop
//!   duplicates inside the deduplication window.
//!
//! Delivery order within a queue is send order. Message groups are not locked
//! against each other.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::message::{OutgoingMessage, ReceiveOptions, ReceivedMessage};
use crate::queue::{
    QueueApi, QueueAttributes, CONTENT_BASED_DEDUPLICATION, FIFO_QUEUE,
    RECEIVE_MESSAGE_WAIT_TIME_SECONDS, VISIBILITY_TIMEOUT,
};

const DEFAULT_VISIBILITY_TIMEOUT: i32 = 30;
const DEDUPLICATION_WINDOW: Duration = Duration::from_secs(300);
const ACCOUNT_ID: &str = "000000000000";

struct StoredMessage {
    message_id: String,
    body: String,
    available_at: Instant,
    receive_count: u32,
}

enum ReceiveAttempt {
    Ready(Vec<ReceivedMessage>),
    WaitUntil(Instant),
}

struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

struct MemoryQueue {
    name: String,
    url: String,
    visibility_timeout: i32,
    receive_wait_time: i32,
    fifo: bool,
    content_based_deduplication: bool,
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlightMessage>,
    /// Deduplication id -> (message id, expiry)
    deduplication: HashMap<String, (String, Instant)>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(name: &str, attributes: &QueueAttributes) -> Self {
        Self {
            name: name.to_string(),
            url: format!("http://localhost/{ACCOUNT_ID}/{name}"),
            visibility_timeout: attributes
                .visibility_timeout_seconds
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT),
            receive_wait_time: attributes.receive_wait_time_seconds.unwrap_or(0),
            fifo: attributes.fifo_queue,
            content_based_deduplication: attributes.content_based_deduplication,
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            deduplication: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn apply(&mut self, attributes: &QueueAttributes) {
        if let Some(visibility) = attributes.visibility_timeout_seconds {
            self.visibility_timeout = visibility;
        }
        if let Some(wait) = attributes.receive_wait_time_seconds {
            self.receive_wait_time = wait;
        }
        if self.fifo && attributes.fifo_queue {
            self.content_based_deduplication = attributes.content_based_deduplication;
        }
    }

    /// Whether the explicitly set values in `attributes` match this queue.
    fn matches(&self, attributes: &QueueAttributes) -> bool {
        attributes
            .visibility_timeout_seconds
            .map_or(true, |v| v == self.visibility_timeout)
            && attributes
                .receive_wait_time_seconds
                .map_or(true, |w| w == self.receive_wait_time)
            && attributes.fifo_queue == self.fifo
    }

    /// Returns expired in-flight deliveries to the front of the queue.
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.visible_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();

        let mut released: Vec<StoredMessage> = expired
            .into_iter()
            .filter_map(|handle| self.in_flight.remove(&handle))
            .map(|in_flight| in_flight.message)
            .collect();
        released.sort_by(|a, b| b.available_at.cmp(&a.available_at));

        for message in released {
            self.messages.push_front(message);
        }

        self.deduplication.retain(|_, (_, expires)| *expires > now);
    }

    fn take_visible(
        &mut self,
        now: Instant,
        max: usize,
        visibility_timeout: Duration,
    ) -> Vec<ReceivedMessage> {
        let mut batch = Vec::new();
        let mut index = 0;

        while batch.len() < max && index < self.messages.len() {
            if self.messages[index].available_at > now {
                index += 1;
                continue;
            }

            let Some(mut message) = self.messages.remove(index) else {
                break;
            };
            message.receive_count += 1;

            let receipt_handle = Uuid::new_v4().to_string();
            batch.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                receipt_handle: receipt_handle.clone(),
            });
            self.in_flight.insert(
                receipt_handle,
                InFlightMessage {
                    message,
                    visible_at: now + visibility_timeout,
                },
            );
        }

        batch
    }

    /// Earliest instant at which a hidden or delayed message becomes visible.
    fn next_visible_at(&self) -> Option<Instant> {
        let delayed = self.messages.iter().map(|m| m.available_at);
        let in_flight = self.in_flight.values().map(|m| m.visible_at);
        delayed.chain(in_flight).min()
    }

    fn attributes(&self, now: Instant) -> BTreeMap<String, String> {
        let visible = self
            .messages
            .iter()
            .filter(|m| m.available_at <= now)
            .count();
        let delayed = self.messages.len() - visible;

        let mut map = BTreeMap::new();
        map.insert(
            "QueueArn".to_string(),
            format!("arn:aws:sqs:local:{ACCOUNT_ID}:{}", self.name),
        );
        map.insert("ApproximateNumberOfMessages".to_string(), visible.to_string());
        map.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            self.in_flight.len().to_string(),
        );
        map.insert(
            "ApproximateNumberOfMessagesDelayed".to_string(),
            delayed.to_string(),
        );
        map.insert(
            VISIBILITY_TIMEOUT.to_string(),
            self.visibility_timeout.to_string(),
        );
        map.insert(
            RECEIVE_MESSAGE_WAIT_TIME_SECONDS.to_string(),
            self.receive_wait_time.to_string(),
        );
        if self.fifo {
            map.insert(FIFO_QUEUE.to_string(), "true".to_string());
            map.insert(
                CONTENT_BASED_DEDUPLICATION.to_string(),
                self.content_based_deduplication.to_string(),
            );
        }
        map
    }
}

/// A [`QueueApi`] implementation that keeps every queue in process memory.
///
/// Cloning is cheap and clones share the same queues, so a producer and any
/// number of consumers can run against one instance.
///
/// ```
/// use sqs_longpoll::{MemoryQueueService, OutgoingMessage, QueueApi, QueueAttributes, ReceiveOptions};
///
/// # tokio_test::block_on(async {
/// let service = MemoryQueueService::new();
/// let url = service.create_queue("demo", &QueueAttributes::default()).await?;
/// service.send_message(&url, &OutgoingMessage::new("hello")).await?;
///
/// let received = service.receive_messages(&url, &ReceiveOptions::default()).await?;
/// assert_eq!(received[0].body, "hello");
/// service.delete_message(&url, &received[0].receipt_handle).await?;
/// # Ok::<(), sqs_longpoll::QueueError>(())
/// # }).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MemoryQueueService {
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
}

impl MemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_queue<T>(&self, queue_url: &str, f: impl FnOnce(&mut MemoryQueue) -> Result<T>) -> Result<T> {
        let mut queues = self.lock();
        let queue = queues
            .values_mut()
            .find(|queue| queue.url == queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(queue_url.to_string()))?;
        f(queue)
    }

    fn invalid_parameter(message: impl Into<String>) -> QueueError {
        QueueError::Service {
            code: "InvalidParameterValue".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl QueueApi for MemoryQueueService {
    async fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<String> {
        attributes.validate()?;

        if attributes.fifo_queue != name.ends_with(".fifo") {
            return Err(Self::invalid_parameter(
                "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix",
            ));
        }

        let mut queues = self.lock();
        if let Some(existing) = queues.get(name) {
            if !existing.matches(attributes) {
                return Err(QueueError::Service {
                    code: "QueueAlreadyExists".to_string(),
                    message: format!(
                        "A queue already exists with the same name and a different value for attribute(s): {name}"
                    ),
                });
            }
            return Ok(existing.url.clone());
        }

        let queue = MemoryQueue::new(name, attributes);
        let url = queue.url.clone();
        info!(queue = name, url = %url, "created queue");
        queues.insert(name.to_string(), queue);
        Ok(url)
    }

    async fn get_queue_url(&self, name: &str) -> Result<String> {
        self.lock()
            .get(name)
            .map(|queue| queue.url.clone())
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<()> {
        attributes.validate()?;
        self.with_queue(queue_url, |queue| {
            queue.apply(attributes);
            Ok(())
        })
    }

    async fn get_queue_attributes(&self, queue_url: &str) -> Result<BTreeMap<String, String>> {
        let now = Instant::now();
        self.with_queue(queue_url, |queue| {
            queue.release_expired(now);
            Ok(queue.attributes(now))
        })
    }

    async fn send_message(&self, queue_url: &str, message: &OutgoingMessage) -> Result<String> {
        message.validate()?;
        let now = Instant::now();

        let (message_id, notify) = self.with_queue(queue_url, |queue| {
            if queue.fifo {
                if !message.is_fifo() {
                    return Err(QueueError::Service {
                        code: "MissingParameter".to_string(),
                        message: "The request must contain the parameter MessageGroupId.".to_string(),
                    });
                }
                if message.delay_seconds.is_some_and(|delay| delay != 0) {
                    return Err(Self::invalid_parameter(format!(
                        "Value {} for parameter DelaySeconds is invalid. Reason: The request include parameter that is not valid for this queue type.",
                        message.delay_seconds.unwrap_or_default()
                    )));
                }
            } else if message.is_fifo() {
                return Err(Self::invalid_parameter(
                    "The request include parameter MessageGroupId that is not valid for this queue type.",
                ));
            }

            queue.release_expired(now);

            let deduplication_id = match (&message.deduplication_id, queue.fifo) {
                (Some(id), _) => Some(id.clone()),
                (None, true) if queue.content_based_deduplication => Some(message.body.clone()),
                (None, true) => {
                    return Err(Self::invalid_parameter(
                        "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly",
                    ))
                }
                (None, false) => None,
            };

            if let Some(id) = &deduplication_id {
                if let Some((existing, _)) = queue.deduplication.get(id) {
                    debug!(queue = %queue.name, message_id = %existing, "dropped duplicate message");
                    return Ok((existing.clone(), None));
                }
            }

            let message_id = Uuid::new_v4().to_string();
            let delay = Duration::from_secs(message.delay_seconds.unwrap_or(0).max(0) as u64);
            queue.messages.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: message.body.clone(),
                available_at: now + delay,
                receive_count: 0,
            });

            if let Some(id) = deduplication_id {
                queue
                    .deduplication
                    .insert(id, (message_id.clone(), now + DEDUPLICATION_WINDOW));
            }

            Ok((message_id, Some(queue.notify.clone())))
        })?;

        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(message_id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        options.validate()?;

        let start = Instant::now();
        let (notify, wait) = self.with_queue(queue_url, |queue| {
            let wait = options.wait_time_seconds.unwrap_or(queue.receive_wait_time);
            Ok((queue.notify.clone(), wait))
        })?;
        let deadline = start + Duration::from_secs(wait.max(0) as u64);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let attempt = self.with_queue(queue_url, |queue| {
                queue.release_expired(now);
                let visibility = Duration::from_secs(
                    options
                        .visibility_timeout
                        .unwrap_or(queue.visibility_timeout)
                        .max(0) as u64,
                );
                let batch = queue.take_visible(now, options.max_messages as usize, visibility);
                if !batch.is_empty() || now >= deadline {
                    return Ok(ReceiveAttempt::Ready(batch));
                }
                let wake_at = queue
                    .next_visible_at()
                    .map_or(deadline, |at| at.min(deadline));
                Ok(ReceiveAttempt::WaitUntil(wake_at))
            })?;

            let wake_at = match attempt {
                ReceiveAttempt::WaitUntil(wake_at) => wake_at,
                ReceiveAttempt::Ready(batch) => {
                    debug!(url = queue_url, count = batch.len(), "received messages");
                    return Ok(batch);
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        if Uuid::parse_str(receipt_handle).is_err() {
            return Err(QueueError::Service {
                code: "ReceiptHandleIsInvalid".to_string(),
                message: format!("The input receipt handle \"{receipt_handle}\" is not a valid receipt handle."),
            });
        }

        self.with_queue(queue_url, |queue| {
            if let Some(in_flight) = queue.in_flight.remove(receipt_handle) {
                debug!(
                    queue = %queue.name,
                    message_id = %in_flight.message.message_id,
                    receive_count = in_flight.message.receive_count,
                    "deleted message"
                );
            }
            Ok(())
        })
    }
}

//! Producers that fill a queue for the consumers to drain.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::error::Result;
use crate::message::{OutgoingMessage, LAST_BATCH_SUFFIX};
use crate::queue::{QueueApi, QueueAttributes};

/// Settings for [`produce`].
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Number of messages to send
    pub message_count: usize,
    /// Number of consumers expected to drain the queue; the last this many
    /// messages are tagged as the last batch
    pub consumer_count: usize,
    /// Per-message delivery delay in seconds
    pub delay_seconds: i32,
    /// Upper bound of the random pause between sends
    pub max_send_jitter: Duration,
    pub body_prefix: String,
    /// Applied to the queue before sending
    pub attributes: QueueAttributes,
    /// Create the queue instead of requiring it to exist
    pub create_queue: bool,
    /// Seed for the jitter generator; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            message_count: 300,
            consumer_count: 4,
            delay_seconds: 1,
            max_send_jitter: Duration::from_millis(1000),
            body_prefix: "Transaction id: ".to_string(),
            attributes: QueueAttributes::long_polling(20).with_visibility_timeout(5),
            create_queue: false,
            seed: None,
        }
    }
}

/// Settings for [`send_fifo_batch`].
#[derive(Debug, Clone)]
pub struct FifoSendSettings {
    pub message_count: usize,
    pub body_prefix: String,
    pub message_group_id: String,
}

impl Default for FifoSendSettings {
    fn default() -> Self {
        Self {
            message_count: 20,
            body_prefix: "messageB".to_string(),
            message_group_id: "localCron".to_string(),
        }
    }
}

/// What a producer run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProduceReport {
    pub queue_url: String,
    pub sent: usize,
    pub last_batch: usize,
}

/// Whether message `index` of `total` falls in the final batch, one message
/// per consumer.
///
/// ```
/// use sqs_longpoll::producer::is_last_batch;
///
/// assert!(!is_last_batch(295, 300, 4));
/// assert!(is_last_batch(296, 300, 4));
/// assert!(is_last_batch(299, 300, 4));
/// ```
pub fn is_last_batch(index: usize, total: usize, consumer_count: usize) -> bool {
    total.saturating_sub(index) <= consumer_count
}

/// Body of message `index`, tagged when it belongs to the last batch.
pub fn message_body(prefix: &str, index: usize, total: usize, consumer_count: usize) -> String {
    if is_last_batch(index, total, consumer_count) {
        format!("{prefix}{index}{LAST_BATCH_SUFFIX}")
    } else {
        format!("{prefix}{index}")
    }
}

/// Applies the long-polling attributes to `queue_name` and sends
/// `settings.message_count` messages with a random pause between sends.
///
/// The first service error aborts the run.
pub async fn produce(
    api: &dyn QueueApi,
    queue_name: &str,
    settings: &ProducerSettings,
) -> Result<ProduceReport> {
    let queue_url = api
        .resolve_queue(queue_name, &settings.attributes, settings.create_queue)
        .await?;
    api.set_queue_attributes(&queue_url, &settings.attributes)
        .await?;

    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let max_jitter_ms = settings.max_send_jitter.as_millis() as u64;

    let mut report = ProduceReport {
        queue_url: queue_url.clone(),
        sent: 0,
        last_batch: 0,
    };

    for index in 0..settings.message_count {
        let body = message_body(
            &settings.body_prefix,
            index,
            settings.message_count,
            settings.consumer_count,
        );
        let message = OutgoingMessage::new(body).with_delay(settings.delay_seconds);

        let message_id = api.send_message(&queue_url, &message).await?;
        info!(message_id = %message_id, body = %message.body, "Sent message");

        report.sent += 1;
        if is_last_batch(index, settings.message_count, settings.consumer_count) {
            report.last_batch += 1;
        }

        if max_jitter_ms > 0 {
            sleep(Duration::from_millis(rng.gen_range(0..max_jitter_ms))).await;
        }
    }

    Ok(report)
}

/// Creates a content-deduplicated FIFO queue and sends a numbered series of
/// messages to a single message group.
pub async fn send_fifo_batch(
    api: &dyn QueueApi,
    queue_name: &str,
    settings: &FifoSendSettings,
) -> Result<ProduceReport> {
    let queue_url = api.create_queue(queue_name, &QueueAttributes::fifo()).await?;

    for index in 0..settings.message_count {
        let message = OutgoingMessage::new(format!("{}{index}", settings.body_prefix))
            .with_group(settings.message_group_id.clone())
            .with_delay(0);

        let message_id = api.send_message(&queue_url, &message).await?;
        info!(message_id = %message_id, body = %message.body, "Sent message");
    }

    Ok(ProduceReport {
        queue_url,
        sent: settings.message_count,
        last_batch: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueueService;
    use crate::message::ReceiveOptions;
    use crate::QueueError;

    fn quick_settings(count: usize) -> ProducerSettings {
        ProducerSettings {
            message_count: count,
            delay_seconds: 0,
            max_send_jitter: Duration::ZERO,
            create_queue: true,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_last_batch_boundaries() {
        assert!(!is_last_batch(0, 300, 4));
        assert!(!is_last_batch(295, 300, 4));
        assert!(is_last_batch(296, 300, 4));
        assert!(is_last_batch(299, 300, 4));

        // Fewer messages than consumers: everything is the last batch.
        assert!(is_last_batch(0, 3, 4));

        // No consumers: nothing is tagged.
        assert!(!is_last_batch(9, 10, 0));
    }

    #[test]
    fn test_message_body() {
        assert_eq!(message_body("Transaction id: ", 12, 300, 4), "Transaction id: 12");
        assert_eq!(
            message_body("Transaction id: ", 297, 300, 4),
            "Transaction id: 297 last batch"
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = ProducerSettings::default();
        assert_eq!(settings.message_count, 300);
        assert_eq!(settings.consumer_count, 4);
        assert_eq!(settings.delay_seconds, 1);
        assert_eq!(settings.max_send_jitter, Duration::from_secs(1));
        assert_eq!(settings.attributes.receive_wait_time_seconds, Some(20));
        assert_eq!(settings.attributes.visibility_timeout_seconds, Some(5));
        assert!(!settings.create_queue);
    }

    #[tokio::test]
    async fn test_produce_tags_last_batch() {
        let service = MemoryQueueService::new();

        let report = produce(&service, "orders", &quick_settings(10)).await.unwrap();
        assert_eq!(report.sent, 10);
        assert_eq!(report.last_batch, 4);

        let options = ReceiveOptions {
            max_messages: 10,
            wait_time_seconds: Some(0),
            visibility_timeout: None,
        };
        let received = service.receive_messages(&report.queue_url, &options).await.unwrap();
        let tagged: Vec<_> = received
            .iter()
            .filter(|m| m.is_last_batch())
            .map(|m| m.body.as_str())
            .collect();
        assert_eq!(
            tagged,
            vec![
                "Transaction id: 6 last batch",
                "Transaction id: 7 last batch",
                "Transaction id: 8 last batch",
                "Transaction id: 9 last batch",
            ]
        );
    }

    #[tokio::test]
    async fn test_produce_applies_attributes() {
        let service = MemoryQueueService::new();
        let report = produce(&service, "orders", &quick_settings(1)).await.unwrap();

        let attributes = service.get_queue_attributes(&report.queue_url).await.unwrap();
        assert_eq!(attributes["ReceiveMessageWaitTimeSeconds"], "20");
        assert_eq!(attributes["VisibilityTimeout"], "5");
    }

    #[tokio::test]
    async fn test_produce_requires_existing_queue_by_default() {
        let service = MemoryQueueService::new();
        let settings = ProducerSettings {
            create_queue: false,
            ..quick_settings(1)
        };

        let result = produce(&service, "missing", &settings).await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_pauses_between_sends() {
        let service = MemoryQueueService::new();
        let settings = ProducerSettings {
            max_send_jitter: Duration::from_millis(1000),
            ..quick_settings(5)
        };

        let started = tokio::time::Instant::now();
        produce(&service, "orders", &settings).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed > Duration::ZERO, "no pause between sends");
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_fifo_batch() {
        let service = MemoryQueueService::new();

        let report = send_fifo_batch(&service, "appCreatedTrxFee.fifo", &FifoSendSettings::default())
            .await
            .unwrap();
        assert_eq!(report.sent, 20);

        let attributes = service.get_queue_attributes(&report.queue_url).await.unwrap();
        assert_eq!(attributes["FifoQueue"], "true");
        assert_eq!(attributes["ContentBasedDeduplication"], "true");
        assert_eq!(attributes["ApproximateNumberOfMessages"], "20");
    }

    #[tokio::test]
    async fn test_send_fifo_batch_twice_deduplicates() {
        let service = MemoryQueueService::new();
        let settings = FifoSendSettings {
            message_count: 3,
            ..Default::default()
        };

        send_fifo_batch(&service, "trx.fifo", &settings).await.unwrap();
        let report = send_fifo_batch(&service, "trx.fifo", &settings).await.unwrap();

        let attributes = service.get_queue_attributes(&report.queue_url).await.unwrap();
        assert_eq!(attributes["ApproximateNumberOfMessages"], "3");
    }
}

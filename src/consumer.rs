//! Long-polling consumer: receive, process, delete, repeat.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::message::{ReceiveOptions, ReceivedMessage, MAX_WAIT_TIME_SECONDS};
use crate::queue::{QueueApi, QueueAttributes};

/// Why a message was not processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("ERROR! Consumer problem")]
    ConsumerProblem,

    #[error("ERROR! Random error")]
    RandomError,
}

/// Simulated failure behavior of a consumer runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Every message fails
    AlwaysFail,
    /// No message fails
    Never,
    /// A message fails when its body ends with a randomly drawn digit
    RandomDigit,
}

impl FailurePolicy {
    /// Runner 3 is broken, runner 4 is healthy, every other runner fails at
    /// random roughly one time in ten.
    pub fn for_runner(runner: u32) -> Self {
        match runner {
            3 => FailurePolicy::AlwaysFail,
            4 => FailurePolicy::Never,
            _ => FailurePolicy::RandomDigit,
        }
    }

    pub fn check<R: Rng + ?Sized>(
        &self,
        body: &str,
        rng: &mut R,
    ) -> std::result::Result<(), ProcessingError> {
        match self {
            FailurePolicy::AlwaysFail => Err(ProcessingError::ConsumerProblem),
            FailurePolicy::Never => Ok(()),
            FailurePolicy::RandomDigit => {
                let digit = rng.gen_range(0..10u32);
                if body.ends_with(&digit.to_string()) {
                    Err(ProcessingError::RandomError)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Settings for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub runner: u32,
    /// Long-poll wait applied to the queue and to every receive
    pub wait_time_seconds: i32,
    pub max_messages: i32,
    /// Overrides the queue's visibility timeout for received messages
    pub visibility_timeout: Option<i32>,
    /// Upper bound of the random time spent "processing" each message
    pub max_processing_delay: Duration,
    /// Stop after the batch that contained a last-batch message
    pub stop_on_last_batch: bool,
    /// Stop after this many receive calls
    pub max_polls: Option<u64>,
    /// Seed for failure and delay randomness; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            runner: 1,
            wait_time_seconds: MAX_WAIT_TIME_SECONDS,
            max_messages: 1,
            visibility_timeout: None,
            max_processing_delay: Duration::from_millis(3000),
            stop_on_last_batch: false,
            max_polls: None,
            seed: None,
        }
    }
}

impl ConsumerSettings {
    pub fn for_runner(runner: u32) -> Self {
        Self {
            runner,
            ..Default::default()
        }
    }

    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.max_messages,
            wait_time_seconds: Some(self.wait_time_seconds),
            visibility_timeout: self.visibility_timeout,
        }
    }
}

/// Result of one receive-process-delete pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub received: usize,
    pub deleted: usize,
    pub failed: usize,
    pub saw_last_batch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    MaxPolls,
    LastBatch,
}

/// Totals over a consumer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    pub runner: u32,
    pub polls: u64,
    pub received: usize,
    pub deleted: usize,
    pub failed: usize,
    pub stop_reason: StopReason,
}

pub struct Consumer<'a> {
    api: &'a dyn QueueApi,
    queue_url: String,
    settings: ConsumerSettings,
    policy: FailurePolicy,
    rng: StdRng,
}

impl<'a> Consumer<'a> {
    /// Looks up `queue_name` and turns on long polling for it.
    ///
    /// # Errors
    ///
    /// * [`QueueError::QueueNotFound`](crate::QueueError::QueueNotFound) if the queue does not exist
    /// * [`QueueError::Validation`](crate::QueueError::Validation) if the settings are out of range
    /// * any service error from the lookup or the attribute update
    pub async fn connect(
        api: &'a dyn QueueApi,
        queue_name: &str,
        settings: ConsumerSettings,
    ) -> Result<Consumer<'a>> {
        settings.receive_options().validate()?;

        let queue_url = api.get_queue_url(queue_name).await?;
        api.set_queue_attributes(
            &queue_url,
            &QueueAttributes::long_polling(settings.wait_time_seconds),
        )
        .await?;

        info!(
            runner = settings.runner,
            queue = queue_name,
            url = %queue_url,
            wait_time_seconds = settings.wait_time_seconds,
            "long polling enabled"
        );

        Ok(Self::with_queue_url(api, queue_url, settings))
    }

    /// Builds a consumer for an already resolved queue without touching its attributes.
    pub fn with_queue_url(
        api: &'a dyn QueueApi,
        queue_url: impl Into<String>,
        settings: ConsumerSettings,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            api,
            queue_url: queue_url.into(),
            policy: FailurePolicy::for_runner(settings.runner),
            settings,
            rng,
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive(&self) -> Result<Vec<ReceivedMessage>> {
        self.api
            .receive_messages(&self.queue_url, &self.settings.receive_options())
            .await
    }

    /// Runs a single receive and processes what it returned.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let messages = self.receive().await?;
        Ok(self.process_batch(messages).await)
    }

    /// Processes each message and deletes the ones that succeed.
    ///
    /// Failed messages are left alone and reappear once their visibility
    /// timeout runs out. A failed delete is logged and counted as a failure.
    pub async fn process_batch(&mut self, messages: Vec<ReceivedMessage>) -> PollOutcome {
        let mut outcome = PollOutcome {
            received: messages.len(),
            ..Default::default()
        };

        for message in messages {
            info!(runner = self.settings.runner, message_id = %message.message_id, body = %message.body, "received");

            if message.is_last_batch() {
                outcome.saw_last_batch = true;
            }

            if let Err(err) = self.policy.check(&message.body, &mut self.rng) {
                warn!(runner = self.settings.runner, message_id = %message.message_id, "{err}");
                outcome.failed += 1;
                continue;
            }

            let max_delay_ms = self.settings.max_processing_delay.as_millis() as u64;
            if max_delay_ms > 0 {
                sleep(Duration::from_millis(self.rng.gen_range(0..max_delay_ms))).await;
            }

            match self
                .api
                .delete_message(&self.queue_url, &message.receipt_handle)
                .await
            {
                Ok(()) => outcome.deleted += 1,
                Err(err) => {
                    warn!(
                        runner = self.settings.runner,
                        message_id = %message.message_id,
                        error = %err,
                        "failed to delete message"
                    );
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    /// Polls until `shutdown` flips to `true` (or its sender goes away), the
    /// poll budget runs out, or a last-batch message is seen when
    /// `stop_on_last_batch` is set.
    ///
    /// Shutdown interrupts a long poll in progress but never a batch that is
    /// being processed.
    ///
    /// # Errors
    ///
    /// Returns the first error from a receive call.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<ConsumeReport> {
        let mut report = ConsumeReport {
            runner: self.settings.runner,
            polls: 0,
            received: 0,
            deleted: 0,
            failed: 0,
            stop_reason: StopReason::Shutdown,
        };

        loop {
            if *shutdown.borrow() {
                report.stop_reason = StopReason::Shutdown;
                break;
            }

            if self
                .settings
                .max_polls
                .is_some_and(|max_polls| report.polls >= max_polls)
            {
                report.stop_reason = StopReason::MaxPolls;
                break;
            }

            let messages = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        report.stop_reason = StopReason::Shutdown;
                        break;
                    }
                    continue;
                }
                messages = self.receive() => messages?,
            };

            report.polls += 1;
            let outcome = self.process_batch(messages).await;
            report.received += outcome.received;
            report.deleted += outcome.deleted;
            report.failed += outcome.failed;

            if self.settings.stop_on_last_batch && outcome.saw_last_batch {
                report.stop_reason = StopReason::LastBatch;
                break;
            }
        }

        info!(
            runner = report.runner,
            polls = report.polls,
            received = report.received,
            deleted = report.deleted,
            failed = report.failed,
            stop_reason = ?report.stop_reason,
            "consumer stopped"
        );

        Ok(report)
    }
}

/// Consumes `queue_name` as runner `runner` with default settings until
/// `shutdown` fires.
pub async fn consume_queue(
    api: &dyn QueueApi,
    queue_name: &str,
    runner: u32,
    shutdown: watch::Receiver<bool>,
) -> Result<ConsumeReport> {
    Consumer::connect(api, queue_name, ConsumerSettings::for_runner(runner))
        .await?
        .run(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueueService;
    use crate::message::OutgoingMessage;
    use crate::QueueError;

    fn fast_settings(runner: u32) -> ConsumerSettings {
        ConsumerSettings {
            runner,
            max_messages: 10,
            max_processing_delay: Duration::ZERO,
            seed: Some(42),
            ..Default::default()
        }
    }

    async fn queue_with(service: &MemoryQueueService, bodies: &[&str]) -> String {
        let url = service
            .create_queue("work", &QueueAttributes::default().with_visibility_timeout(5))
            .await
            .unwrap();
        for body in bodies {
            service
                .send_message(&url, &OutgoingMessage::new(*body))
                .await
                .unwrap();
        }
        url
    }

    #[test]
    fn test_policy_for_runner() {
        assert_eq!(FailurePolicy::for_runner(1), FailurePolicy::RandomDigit);
        assert_eq!(FailurePolicy::for_runner(2), FailurePolicy::RandomDigit);
        assert_eq!(FailurePolicy::for_runner(3), FailurePolicy::AlwaysFail);
        assert_eq!(FailurePolicy::for_runner(4), FailurePolicy::Never);
    }

    #[test]
    fn test_policy_check() {
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(
            FailurePolicy::AlwaysFail.check("Transaction id: 1", &mut rng),
            Err(ProcessingError::ConsumerProblem)
        );
        for i in 0..100 {
            assert!(FailurePolicy::Never
                .check(&format!("Transaction id: {i}"), &mut rng)
                .is_ok());
        }

        // A body that does not end with a digit can never hit the random failure.
        for _ in 0..100 {
            assert!(FailurePolicy::RandomDigit
                .check("Transaction id: 7 last batch", &mut rng)
                .is_ok());
        }
    }

    #[test]
    fn test_random_policy_fails_sometimes() {
        let mut rng = StdRng::seed_from_u64(99);
        let failures = (0..1000)
            .filter(|_| FailurePolicy::RandomDigit.check("Transaction id: 5", &mut rng).is_err())
            .count();

        assert!(failures > 50 && failures < 150, "got {failures} failures");
    }

    #[test]
    fn test_processing_error_messages() {
        assert_eq!(ProcessingError::ConsumerProblem.to_string(), "ERROR! Consumer problem");
        assert_eq!(ProcessingError::RandomError.to_string(), "ERROR! Random error");
    }

    #[tokio::test]
    async fn test_connect_enables_long_polling() {
        let service = MemoryQueueService::new();
        queue_with(&service, &[]).await;

        let consumer = Consumer::connect(&service, "work", fast_settings(4)).await.unwrap();
        let attributes = service.get_queue_attributes(consumer.queue_url()).await.unwrap();
        assert_eq!(attributes["ReceiveMessageWaitTimeSeconds"], "20");
    }

    #[tokio::test]
    async fn test_connect_missing_queue() {
        let service = MemoryQueueService::new();
        let result = Consumer::connect(&service, "nope", fast_settings(1)).await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_settings() {
        let service = MemoryQueueService::new();
        queue_with(&service, &[]).await;

        let settings = ConsumerSettings {
            max_messages: 11,
            ..fast_settings(1)
        };
        let result = Consumer::connect(&service, "work", settings).await;
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_healthy_runner_deletes_everything() {
        let service = MemoryQueueService::new();
        let url = queue_with(&service, &["Transaction id: 1", "Transaction id: 2"]).await;

        let mut consumer = Consumer::with_queue_url(&service, &url, fast_settings(4));
        let outcome = consumer.poll_once().await.unwrap();

        assert_eq!(
            outcome,
            PollOutcome {
                received: 2,
                deleted: 2,
                failed: 0,
                saw_last_batch: false,
            }
        );
        let attributes = service.get_queue_attributes(&url).await.unwrap();
        assert_eq!(attributes["ApproximateNumberOfMessagesNotVisible"], "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_runner_leaves_messages_for_redelivery() {
        let service = MemoryQueueService::new();
        let url = queue_with(&service, &["Transaction id: 1"]).await;

        let mut broken = Consumer::with_queue_url(&service, &url, fast_settings(3));
        let outcome = broken.poll_once().await.unwrap();
        assert_eq!(outcome.received, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.deleted, 0);

        // After the 5 second visibility timeout a healthy runner gets it.
        let mut healthy = Consumer::with_queue_url(&service, &url, fast_settings(4));
        let outcome = healthy.poll_once().await.unwrap();
        assert_eq!(outcome.deleted, 1);
    }

    #[tokio::test]
    async fn test_failed_delete_is_counted() {
        let service = MemoryQueueService::new();
        let url = queue_with(&service, &[]).await;
        let mut consumer = Consumer::with_queue_url(&service, &url, fast_settings(4));

        let outcome = consumer
            .process_batch(vec![ReceivedMessage {
                message_id: "m-1".to_string(),
                body: "Transaction id: 1".to_string(),
                receipt_handle: "garbage".to_string(),
            }])
            .await;

        assert_eq!(outcome.received, 1);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_after_max_polls() {
        let service = MemoryQueueService::new();
        let url = queue_with(&service, &[]).await;
        let (_tx, rx) = watch::channel(false);

        let settings = ConsumerSettings {
            max_polls: Some(3),
            ..fast_settings(4)
        };
        let report = Consumer::with_queue_url(&service, &url, settings)
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.polls, 3);
        assert_eq!(report.received, 0);
        assert_eq!(report.stop_reason, StopReason::MaxPolls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_last_batch() {
        let service = MemoryQueueService::new();
        let url = queue_with(
            &service,
            &["Transaction id: 0", "Transaction id: 1 last batch"],
        )
        .await;
        let (_tx, rx) = watch::channel(false);

        let settings = ConsumerSettings {
            max_messages: 1,
            stop_on_last_batch: true,
            ..fast_settings(4)
        };
        let report = Consumer::with_queue_url(&service, &url, settings)
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.polls, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.stop_reason, StopReason::LastBatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_interrupts_long_poll_on_shutdown() {
        let service = MemoryQueueService::new();
        let url = queue_with(&service, &[]).await;
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            let _ = tx.send(true);
        });

        let started = tokio::time::Instant::now();
        let report = Consumer::with_queue_url(&service, &url, fast_settings(4))
            .run(rx)
            .await
            .unwrap();

        assert_eq!(report.polls, 0);
        assert_eq!(report.stop_reason, StopReason::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_run_returns_receive_errors() {
        let service = MemoryQueueService::new();
        let (_tx, rx) = watch::channel(false);

        let result = Consumer::with_queue_url(&service, "http://localhost/000000000000/gone", fast_settings(1))
            .run(rx)
            .await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
    }
}

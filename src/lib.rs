//! # sqs-longpoll
//!
//! A producer and consumers for [Amazon SQS](https://aws.amazon.com/sqs/)
//! built around long polling.
//!
//! The producer fills a standard queue with numbered messages and tags the
//! final few as the "last batch". Consumers look the queue up, turn on long
//! polling, then loop: receive a batch, process each message (optionally
//! simulating a failure) and delete the ones that succeeded. Failed messages
//! are simply left alone; the queue hands them out again once their
//! visibility timeout runs out.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sqs_longpoll::{consumer, producer, ConfigBuilder, SqsClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigBuilder::new().region("eu-north-1").build();
//!     let client = SqsClient::new(config.clone()).await;
//!
//!     let report = producer::produce(&client, &config.queue_name, &Default::default()).await?;
//!     println!("sent {} messages", report.sent);
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     consumer::consume_queue(&client, &config.queue_name, 1, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! Producer and consumer both talk to the [`QueueApi`] trait:
//!
//! - [`SqsClient`] calls the real service through the AWS SDK, retrying
//!   transient failures with exponential backoff.
//! - [`MemoryQueueService`] keeps queues in process memory with visibility
//!   timeouts and long polling, for tests and offline runs.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod memory;
pub mod message;
pub mod producer;
pub mod queue;
mod retry;

pub use client::SqsClient;
pub use config::{Config, ConfigBuilder};
pub use consumer::{ConsumeReport, Consumer, ConsumerSettings, FailurePolicy};
pub use error::{QueueError, Result};
pub use memory::MemoryQueueService;
pub use message::{OutgoingMessage, ReceiveOptions, ReceivedMessage};
pub use producer::{FifoSendSettings, ProduceReport, ProducerSettings};
pub use queue::{QueueApi, QueueAttributes};

/// Renders queue attributes as pretty-printed JSON.
pub fn attributes_to_json(
    attributes: &std::collections::BTreeMap<String, String>,
) -> Result<String> {
    Ok(serde_json::to_string_pretty(attributes)?)
}

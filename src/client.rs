use crate::{
    config::{Config, ConfigBuilder},
    error::{QueueError, Result},
    message::{OutgoingMessage, ReceiveOptions, ReceivedMessage},
    queue::{QueueApi, QueueAttributes},
    retry::RetryStrategy,
};
use async_trait::async_trait;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion};
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::types::QueueAttributeName;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Client for Amazon SQS.
///
/// `SqsClient` wraps the AWS SDK client with request validation and error
/// mapping. Transient failures such as throttling are retried with exponential
/// backoff; everything else is returned to the caller as a [`QueueError`].
///
/// # Examples
///
/// ```no_run
/// use sqs_longpoll::{OutgoingMessage, QueueApi, ReceiveOptions, SqsClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), sqs_longpoll::QueueError> {
///     let client = SqsClient::new(SqsClient::builder().region("eu-north-1").build()).await;
///
///     let url = client.get_queue_url("testQueueLongVisibilty5").await?;
///     client
///         .send_message(&url, &OutgoingMessage::new("Hello, World!"))
///         .await?;
///
///     for message in client.receive_messages(&url, &ReceiveOptions::default()).await? {
///         println!("Retrieved: {}", message.body);
///         client.delete_message(&url, &message.receipt_handle).await?;
///     }
///
///     Ok(())
/// }
/// ```
pub struct SqsClient {
    client: aws_sdk_sqs::Client,
    config: Config,
}

impl SqsClient {
    /// Creates a client from `config`, loading credentials from the standard
    /// AWS provider chain (or the named profile when one is set).
    ///
    /// The SDK's own retry layer is turned off so that [`Config::max_retries`]
    /// is the only retry budget in play.
    pub async fn new(config: Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            );

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }

        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let shared_config = loader.load().await;
        let sqs_config = aws_sdk_sqs::config::Builder::from(&shared_config)
            .retry_config(RetryConfig::disabled())
            .build();

        Self::from_client(aws_sdk_sqs::Client::from_conf(sqs_config), config)
    }

    /// Wraps an already configured SDK client.
    pub fn from_client(client: aws_sdk_sqs::Client, config: Config) -> Self {
        Self { client, config }
    }

    /// Returns a [`ConfigBuilder`] for creating custom configurations.
    ///
    /// This is a convenience method that's equivalent to [`ConfigBuilder::new()`].
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::from(&self.config)
    }

    fn map_err<E, R>(&self, err: aws_sdk_sqs::error::SdkError<E, R>) -> QueueError
    where
        E: aws_sdk_sqs::error::ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        QueueError::from_sdk(err, self.config.timeout)
    }

    /// The service reports a missing queue with a generic message; name the queue instead.
    fn name_missing_queue(err: QueueError, name: &str) -> QueueError {
        match err {
            QueueError::QueueNotFound(_) => QueueError::QueueNotFound(name.to_string()),
            other => other,
        }
    }

    fn missing_field(operation: &str, field: &str) -> QueueError {
        QueueError::Service {
            code: "InvalidResponse".to_string(),
            message: format!("{operation} response did not include {field}"),
        }
    }
}

#[async_trait]
impl QueueApi for SqsClient {
    async fn create_queue(&self, name: &str, attributes: &QueueAttributes) -> Result<String> {
        attributes.validate()?;

        self.retry_strategy()
            .execute("create_queue", || async {
                let mut request = self.client.create_queue().queue_name(name);
                for (key, value) in attributes.creation_attributes() {
                    request = request.attributes(QueueAttributeName::from(key), value);
                }

                let output = request.send().await.map_err(|e| self.map_err(e))?;
                let url = output
                    .queue_url()
                    .ok_or_else(|| Self::missing_field("CreateQueue", "QueueUrl"))?;

                debug!(queue = name, url, "queue created");
                Ok(url.to_string())
            })
            .await
    }

    async fn get_queue_url(&self, name: &str) -> Result<String> {
        self.retry_strategy()
            .execute("get_queue_url", || async {
                let output = self
                    .client
                    .get_queue_url()
                    .queue_name(name)
                    .send()
                    .await
                    .map_err(|e| Self::name_missing_queue(self.map_err(e), name))?;

                output
                    .queue_url()
                    .map(str::to_string)
                    .ok_or_else(|| Self::missing_field("GetQueueUrl", "QueueUrl"))
            })
            .await
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<()> {
        attributes.validate()?;

        let values = attributes.mutable_attributes();
        if values.is_empty() {
            return Ok(());
        }

        self.retry_strategy()
            .execute("set_queue_attributes", || async {
                let mut request = self.client.set_queue_attributes().queue_url(queue_url);
                for (key, value) in &values {
                    request = request.attributes(QueueAttributeName::from(*key), value.clone());
                }

                request.send().await.map_err(|e| self.map_err(e))?;
                Ok(())
            })
            .await
    }

    async fn get_queue_attributes(&self, queue_url: &str) -> Result<BTreeMap<String, String>> {
        self.retry_strategy()
            .execute("get_queue_attributes", || async {
                let output = self
                    .client
                    .get_queue_attributes()
                    .queue_url(queue_url)
                    .attribute_names(QueueAttributeName::All)
                    .send()
                    .await
                    .map_err(|e| self.map_err(e))?;

                Ok(output
                    .attributes()
                    .map(|attributes| {
                        attributes
                            .iter()
                            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default())
            })
            .await
    }

    async fn send_message(&self, queue_url: &str, message: &OutgoingMessage) -> Result<String> {
        message.validate()?;

        self.retry_strategy()
            .execute("send_message", || async {
                let output = self
                    .client
                    .send_message()
                    .queue_url(queue_url)
                    .message_body(message.body.clone())
                    .set_delay_seconds(message.delay_seconds)
                    .set_message_group_id(message.message_group_id.clone())
                    .set_message_deduplication_id(message.deduplication_id.clone())
                    .send()
                    .await
                    .map_err(|e| self.map_err(e))?;

                output
                    .message_id()
                    .map(str::to_string)
                    .ok_or_else(|| Self::missing_field("SendMessage", "MessageId"))
            })
            .await
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        options.validate()?;
        if let Some(wait) = options.wait_time_seconds {
            self.config.validate_long_poll(wait)?;
        }

        self.retry_strategy()
            .execute("receive_messages", || async {
                let output = self
                    .client
                    .receive_message()
                    .queue_url(queue_url)
                    .max_number_of_messages(options.max_messages)
                    .set_wait_time_seconds(options.wait_time_seconds)
                    .set_visibility_timeout(options.visibility_timeout)
                    .send()
                    .await
                    .map_err(|e| self.map_err(e))?;

                let mut messages = Vec::with_capacity(output.messages().len());
                for message in output.messages() {
                    let Some(receipt_handle) = message.receipt_handle() else {
                        warn!(
                            message_id = message.message_id().unwrap_or("unknown"),
                            "received message without a receipt handle, skipping"
                        );
                        continue;
                    };

                    messages.push(ReceivedMessage {
                        message_id: message.message_id().unwrap_or_default().to_string(),
                        body: message.body().unwrap_or_default().to_string(),
                        receipt_handle: receipt_handle.to_string(),
                    });
                }

                Ok(messages)
            })
            .await
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        if receipt_handle.is_empty() {
            return Err(QueueError::Validation(
                "Receipt handle must not be empty".to_string(),
            ));
        }

        self.retry_strategy()
            .execute("delete_message", || async {
                self.client
                    .delete_message()
                    .queue_url(queue_url)
                    .receipt_handle(receipt_handle)
                    .send()
                    .await
                    .map_err(|e| self.map_err(e))?;
                Ok(())
            })
            .await
    }
}

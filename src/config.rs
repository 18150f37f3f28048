use std::time::Duration;

use crate::error::{QueueError, Result};

/// Region the demo queues live in unless told otherwise.
pub const DEFAULT_REGION: &str = "eu-north-1";

/// Standard queue used by the long-polling producer and consumers.
pub const DEFAULT_QUEUE_NAME: &str = "testQueueLongVisibilty5";

/// FIFO queue used by the simple sender.
pub const DEFAULT_FIFO_QUEUE_NAME: &str = "appCreatedTrxFee.fifo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub region: String,
    /// Named profile in the shared credentials file; `None` uses the default chain
    pub profile: Option<String>,
    /// Overrides the service endpoint, e.g. for a local emulator
    pub endpoint_url: Option<String>,
    pub queue_name: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            profile: None,
            endpoint_url: None,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn is_fifo_queue(&self) -> bool {
        self.queue_name.ends_with(".fifo")
    }

    /// Checks that a receive waiting `wait_time_seconds` finishes inside the
    /// operation timeout.
    pub fn validate_long_poll(&self, wait_time_seconds: i32) -> Result<()> {
        let wait = Duration::from_secs(u64::try_from(wait_time_seconds).unwrap_or(0));
        if self.timeout <= wait {
            return Err(QueueError::Validation(format!(
                "Timeout of {}ms must exceed the long-poll wait of {}s",
                self.timeout.as_millis(),
                wait_time_seconds
            )));
        }
        Ok(())
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    pub fn profile(mut self, profile: Option<String>) -> Self {
        self.config.profile = profile;
        self
    }

    pub fn endpoint_url(mut self, endpoint_url: Option<String>) -> Self {
        self.config.endpoint_url = endpoint_url;
        self
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.config.queue_name = queue_name.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout = Duration::from_millis(ms);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay = Duration::from_millis(ms);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ConfigBuilder::new().build();

        assert_eq!(config.region, "eu-north-1");
        assert_eq!(config.queue_name, "testQueueLongVisibilty5");
        assert_eq!(config.profile, None);
        assert_eq!(config.endpoint_url, None);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert!(!config.is_fifo_queue());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .region("us-east-1")
            .profile(Some("dev".to_string()))
            .endpoint_url(Some("http://localhost:9324".to_string()))
            .queue_name(DEFAULT_FIFO_QUEUE_NAME)
            .timeout_ms(5000)
            .max_retries(5)
            .retry_delay_ms(200)
            .build();

        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.profile.as_deref(), Some("dev"));
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:9324"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert!(config.is_fifo_queue());
    }

    #[test]
    fn test_validate_long_poll() {
        let config = ConfigBuilder::new().build();
        assert!(config.validate_long_poll(20).is_ok());
        assert!(config.validate_long_poll(0).is_ok());

        let short = ConfigBuilder::new().timeout_ms(5000).build();
        assert!(short.validate_long_poll(1).is_ok());
        match short.validate_long_poll(20) {
            Err(QueueError::Validation(msg)) => {
                assert_eq!(msg, "Timeout of 5000ms must exceed the long-poll wait of 20s");
            }
            other => panic!("Expected validation error, got {other:?}"),
        }

        let equal = ConfigBuilder::new().timeout_ms(20_000).build();
        assert!(equal.validate_long_poll(20).is_err());
    }
}

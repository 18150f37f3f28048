use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use sqs_longpoll::{
    attributes_to_json,
    config::{DEFAULT_FIFO_QUEUE_NAME, DEFAULT_QUEUE_NAME, DEFAULT_REGION},
    consumer::{ConsumeReport, Consumer, ConsumerSettings},
    logging::{self, LogFormat},
    producer, Config, ConfigBuilder, FifoSendSettings, MemoryQueueService, ProducerSettings,
    QueueApi, QueueAttributes, SqsClient,
};

#[derive(Parser, Debug)]
#[command(name = "sqs-longpoll", version, about = "Long-polling SQS producer and consumers")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SQS_LONGPOLL_LOG_LEVEL")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(long, global = true, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Named profile from the shared AWS config files
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Custom endpoint, e.g. a local SQS emulator
    #[arg(long, global = true, env = "SQS_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// Per-operation timeout in milliseconds; must exceed the long-poll wait
    #[arg(long, global = true, default_value_t = 30_000)]
    timeout_ms: u64,

    #[arg(long, global = true, default_value_t = 3)]
    max_retries: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable long polling on a queue and fill it with numbered messages
    Produce {
        #[arg(long, env = "SQS_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
        queue: String,

        #[arg(long, default_value_t = 300)]
        count: usize,

        /// Consumers expected to drain the queue; sizes the last batch
        #[arg(long, default_value_t = 4)]
        consumers: usize,

        #[arg(long, default_value_t = 1)]
        delay_seconds: i32,

        /// Upper bound of the random pause between sends
        #[arg(long, default_value_t = 1000)]
        jitter_ms: u64,

        /// Create the queue if it does not exist
        #[arg(long)]
        create: bool,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Create a FIFO queue and send a series of messages to one message group
    Send {
        #[arg(long, default_value = DEFAULT_FIFO_QUEUE_NAME)]
        queue: String,

        #[arg(long, default_value_t = 20)]
        count: usize,

        #[arg(long, default_value = "messageB")]
        prefix: String,

        #[arg(long, default_value = "localCron")]
        group: String,
    },

    /// Long-poll a queue, process messages and delete the ones that succeed
    Consume {
        #[arg(long, env = "SQS_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
        queue: String,

        #[command(flatten)]
        consumer: ConsumerArgs,
    },

    /// Print every attribute of a queue as JSON
    Attributes {
        #[arg(long, env = "SQS_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
        queue: String,
    },

    /// Run a producer and several consumers against an in-process queue
    Demo {
        #[arg(long, default_value_t = 40)]
        count: usize,

        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
        consumers: u32,

        /// Visibility timeout of the demo queue in seconds
        #[arg(long, default_value_t = 5)]
        visibility_timeout: i32,
    },
}

#[derive(Args, Debug)]
struct ConsumerArgs {
    /// Runner number; 3 always fails, 4 never fails at random
    #[arg(long, default_value_t = 1)]
    runner: u32,

    #[arg(long, default_value_t = 20)]
    wait_time_seconds: i32,

    #[arg(long, default_value_t = 1)]
    max_messages: i32,

    #[arg(long)]
    visibility_timeout: Option<i32>,

    /// Upper bound of the random time spent on each message
    #[arg(long, default_value_t = 3000)]
    max_processing_ms: u64,

    /// Stop once a message tagged "last batch" has been received
    #[arg(long)]
    stop_on_last_batch: bool,

    #[arg(long)]
    max_polls: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,
}

impl ConsumerArgs {
    fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            runner: self.runner,
            wait_time_seconds: self.wait_time_seconds,
            max_messages: self.max_messages,
            visibility_timeout: self.visibility_timeout,
            max_processing_delay: Duration::from_millis(self.max_processing_ms),
            stop_on_last_batch: self.stop_on_last_batch,
            max_polls: self.max_polls,
            seed: self.seed,
        }
    }
}

impl ConnectionArgs {
    fn config(&self, queue_name: &str) -> Config {
        ConfigBuilder::new()
            .region(self.region.clone())
            .profile(self.profile.clone())
            .endpoint_url(self.endpoint_url.clone())
            .queue_name(queue_name)
            .timeout_ms(self.timeout_ms)
            .max_retries(self.max_retries)
            .build()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Produce {
            queue,
            count,
            consumers,
            delay_seconds,
            jitter_ms,
            create,
            seed,
        } => {
            let config = cli.connection.config(&queue);
            let client = SqsClient::new(config.clone()).await;
            let settings = ProducerSettings {
                message_count: count,
                consumer_count: consumers,
                delay_seconds,
                max_send_jitter: Duration::from_millis(jitter_ms),
                create_queue: create,
                seed,
                ..Default::default()
            };

            let report = producer::produce(&client, &config.queue_name, &settings)
                .await
                .with_context(|| format!("producing to {}", config.queue_name))?;
            print_json(&report)
        }
        Command::Send {
            queue,
            count,
            prefix,
            group,
        } => {
            let config = cli.connection.config(&queue);
            anyhow::ensure!(
                config.is_fifo_queue(),
                "FIFO queue name must end with .fifo: {}",
                config.queue_name
            );

            let client = SqsClient::new(config.clone()).await;
            let settings = FifoSendSettings {
                message_count: count,
                body_prefix: prefix,
                message_group_id: group,
            };

            let report = producer::send_fifo_batch(&client, &config.queue_name, &settings)
                .await
                .with_context(|| format!("sending to {}", config.queue_name))?;
            print_json(&report)
        }
        Command::Consume { queue, consumer } => {
            let config = cli.connection.config(&queue);
            config.validate_long_poll(consumer.wait_time_seconds)?;

            let client = SqsClient::new(config.clone()).await;
            let shutdown = shutdown_on_ctrl_c();

            let report = Consumer::connect(&client, &config.queue_name, consumer.settings())
                .await
                .with_context(|| format!("connecting to {}", config.queue_name))?
                .run(shutdown)
                .await
                .with_context(|| format!("consuming from {}", config.queue_name))?;
            print_json(&report)
        }
        Command::Attributes { queue } => {
            let client = SqsClient::new(cli.connection.config(&queue)).await;
            let url = client.get_queue_url(&client.config().queue_name).await?;
            let attributes = client.get_queue_attributes(&url).await?;
            println!("{}", attributes_to_json(&attributes)?);
            Ok(())
        }
        Command::Demo {
            count,
            consumers,
            visibility_timeout,
        } => run_demo(count, consumers, visibility_timeout).await,
    }
}

/// Fills an in-process queue and drains it with `consumers` concurrent runners.
async fn run_demo(count: usize, consumers: u32, visibility_timeout: i32) -> anyhow::Result<()> {
    let service = MemoryQueueService::new();
    let attributes = QueueAttributes::long_polling(20).with_visibility_timeout(visibility_timeout);
    let queue_url = service.create_queue(DEFAULT_QUEUE_NAME, &attributes).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runners = Vec::new();
    for runner in 1..=consumers {
        let service = service.clone();
        let shutdown = shutdown_rx.clone();
        runners.push(tokio::spawn(async move {
            let settings = ConsumerSettings {
                max_processing_delay: Duration::from_millis(200),
                ..ConsumerSettings::for_runner(runner)
            };
            Consumer::connect(&service, DEFAULT_QUEUE_NAME, settings)
                .await?
                .run(shutdown)
                .await
        }));
    }

    let settings = ProducerSettings {
        message_count: count,
        consumer_count: consumers as usize,
        max_send_jitter: Duration::from_millis(50),
        ..Default::default()
    };
    let produced = producer::produce(&service, DEFAULT_QUEUE_NAME, &settings).await?;
    info!(sent = produced.sent, "producer finished, waiting for the queue to drain");

    let mut ctrl_c = shutdown_on_ctrl_c();
    loop {
        let attributes = service.get_queue_attributes(&queue_url).await?;
        let remaining: usize = [
            "ApproximateNumberOfMessages",
            "ApproximateNumberOfMessagesNotVisible",
            "ApproximateNumberOfMessagesDelayed",
        ]
        .iter()
        .filter_map(|key| attributes.get(*key)?.parse::<usize>().ok())
        .sum();

        if remaining == 0 || *ctrl_c.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = ctrl_c.changed() => {}
        }
    }

    let _ = shutdown_tx.send(true);

    let mut reports: Vec<ConsumeReport> = Vec::new();
    for runner in runners {
        reports.push(runner.await.context("consumer task panicked")??);
    }

    #[derive(Serialize)]
    struct DemoReport {
        produced: producer::ProduceReport,
        consumers: Vec<ConsumeReport>,
    }

    print_json(&DemoReport {
        produced,
        consumers: reports,
    })
}

/// Returns a receiver that flips to `true` on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = tx.send(true);
        } else {
            // Keep the sender alive so consumers do not read its drop as a shutdown.
            std::future::pending::<()>().await;
        }
    });
    rx
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_rejects_zero_consumers() {
        assert!(Cli::try_parse_from(["sqs-longpoll", "demo", "--consumers", "0"]).is_err());

        let cli = Cli::try_parse_from(["sqs-longpoll", "demo"]).unwrap();
        match cli.command {
            Command::Demo { consumers, .. } => assert_eq!(consumers, 4),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_consume_timeout_must_cover_long_poll() {
        let cli = Cli::try_parse_from([
            "sqs-longpoll",
            "--timeout-ms",
            "5000",
            "consume",
            "--queue",
            "orders",
        ])
        .unwrap();

        let Command::Consume { queue, consumer } = cli.command else {
            panic!("expected consume");
        };
        let config = cli.connection.config(&queue);
        assert_eq!(config.queue_name, "orders");
        assert!(config.validate_long_poll(consumer.wait_time_seconds).is_err());

        let cli = Cli::try_parse_from(["sqs-longpoll", "consume", "--queue", "orders"]).unwrap();
        let Command::Consume { queue, consumer } = cli.command else {
            panic!("expected consume");
        };
        assert!(cli
            .connection
            .config(&queue)
            .validate_long_poll(consumer.wait_time_seconds)
            .is_ok());
    }

    #[test]
    fn test_send_defaults_to_fifo_queue() {
        let cli = Cli::try_parse_from(["sqs-longpoll", "send"]).unwrap();
        let Command::Send { queue, count, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(count, 20);
        assert!(cli.connection.config(&queue).is_fifo_queue());
    }
}

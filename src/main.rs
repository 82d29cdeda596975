//! kafka-tail: print records from Kafka topics and commit each one
//!
//! Reads through the buffered pull source, so a slow terminal pauses the
//! consumer instead of growing memory.

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;
use kafka_pull_source::consumer::{
    ConsumerSettings, KafkaClientFactory, RestartingSource, RetryPolicy, StringDeserializer,
    Subscription,
};
use kafka_pull_source::telemetry::{init_logging, LogConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kafka-tail")]
#[command(about = "Tail Kafka topics through a backpressured pull source", long_about = None)]
struct Args {
    /// Broker addresses (comma-separated)
    #[arg(short, long, default_value = "localhost:9092")]
    brokers: String,

    /// Consumer group ID; a random one when omitted
    #[arg(short, long)]
    group_id: Option<String>,

    /// Topics to subscribe to
    #[arg(short, long, value_delimiter = ',')]
    topics: Vec<String>,

    /// Topic regex to subscribe to instead of fixed topics
    #[arg(short, long, conflicts_with = "topics")]
    pattern: Option<String>,

    /// Records buffered before the consumer is paused
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Start from the earliest offset when the group has no commit
    #[arg(long)]
    from_beginning: bool,

    /// Settings file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print record timestamps
    #[arg(long)]
    timestamps: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn settings(&self) -> Result<ConsumerSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                ConsumerSettings::from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?
            }
            None => ConsumerSettings::default(),
        }
        .with_env_overrides();

        settings.bootstrap_servers = self.brokers.clone();
        settings.group_id = self
            .group_id
            .clone()
            .unwrap_or_else(|| format!("kafka-tail-{}", uuid::Uuid::new_v4()));
        if let Some(size) = self.buffer_size {
            settings.buffer_size = size;
        }
        if self.from_beginning {
            settings.auto_offset_reset = "earliest".to_string();
        }
        settings.validate()?;
        Ok(settings)
    }

    fn subscription(&self) -> Result<Subscription> {
        let subscription = match &self.pattern {
            Some(pattern) => Subscription::topic_pattern(pattern.clone()),
            None if self.topics.is_empty() => bail!("Either --topics or --pattern is required"),
            None => Subscription::topics(self.topics.iter().cloned()),
        };
        subscription.validate()?;
        Ok(subscription)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::from_flags(args.debug, args.json))?;

    let settings = args.settings()?;
    let subscription = args.subscription()?;
    info!(
        brokers = %settings.bootstrap_servers,
        group_id = %settings.group_id,
        "Starting kafka-tail"
    );

    let factory = KafkaClientFactory::<Option<String>, Option<String>>::new(
        StringDeserializer,
        StringDeserializer,
    );
    let mut source = RestartingSource::new(settings, subscription, factory, RetryPolicy::default());

    let shutdown = source.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    let mut count: u64 = 0;
    while let Some(next) = source.pull().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                error!("Source failed: {}", e);
                return Err(e.into());
            }
        };

        let record = &message.record;
        let value = record.value.as_deref().unwrap_or("<null>");
        match record.timestamp.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            Some(ts) if args.timestamps => println!(
                "[{}] {}/{} {} {}",
                record.topic,
                record.partition,
                record.offset,
                ts.to_rfc3339(),
                value
            ),
            _ => println!("[{}] {}/{} {}", record.topic, record.partition, record.offset, value),
        }

        message.committable_offset.commit()?;
        count += 1;
    }

    info!(records = count, restarts = source.restarts(), "kafka-tail finished");
    Ok(())
}

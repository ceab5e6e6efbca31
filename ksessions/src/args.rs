//! Command-line argument types for ksessions
//!
//! [`Args`] configures the process; [`ConsoleLine`] parses each operator
//! command typed into the console.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;

use ksessions::config::{parse_bootstrap, ConsumerSettings, HarnessConfig, OffsetReset, TrackerSettings};

/// Command-line arguments for the session console
#[derive(Parser, Debug)]
#[command(name = "ksessions")]
#[command(about = "Start and stop Kafka producer and consumer sessions and watch group progress")]
pub struct Args {
    /// Kafka bootstrap servers, comma separated; only used to discover the cluster,
    /// requests then go to each partition's leader and each group's coordinator
    #[arg(short, long, default_value = "localhost:9092")]
    pub broker: String,

    /// Use the embedded in-memory broker instead of connecting to Kafka
    #[arg(long, default_value = "false")]
    pub in_memory: bool,

    /// Partitions given to topics auto-created by the in-memory broker
    #[arg(long, default_value = "3")]
    pub memory_partitions: usize,

    /// Producer message, request, socket and metadata-age timeout in milliseconds
    #[arg(long, default_value = "5000")]
    pub send_timeout_ms: u64,

    /// Bound on each consumer poll in milliseconds
    #[arg(long, default_value = "100")]
    pub poll_timeout_ms: u64,

    /// Seconds a stopping session may take before its connection is closed anyway
    #[arg(long, default_value = "5")]
    pub stop_grace_secs: u64,

    /// Lower bound of the simulated per-message processing time in milliseconds
    #[arg(long, default_value = "500")]
    pub processing_min_ms: u64,

    /// Upper bound (exclusive) of the simulated per-message processing time in milliseconds
    #[arg(long, default_value = "1000")]
    pub processing_max_ms: u64,

    /// Progress tracker refresh period in milliseconds
    #[arg(long, default_value = "1000")]
    pub refresh_ms: u64,

    /// Entries kept in each of the producer and consumer log buffers
    #[arg(long, default_value = "1000")]
    pub log_capacity: usize,

    /// Where consumers start when their group has no committed offset
    #[arg(long, value_enum, default_value = "earliest")]
    pub offset_reset: OffsetReset,

    /// Quiet mode: only errors reach the process log
    #[arg(short, long, default_value = "false")]
    pub quiet: bool,
}

impl Args {
    /// Validates the arguments and assembles the registry configuration
    pub fn harness_config(&self) -> Result<HarnessConfig> {
        let bootstrap = parse_bootstrap(&self.broker);
        if bootstrap.is_empty() {
            bail!("--broker must name at least one bootstrap server");
        }
        if self.processing_min_ms > self.processing_max_ms {
            bail!(
                "--processing-min-ms ({}) exceeds --processing-max-ms ({})",
                self.processing_min_ms,
                self.processing_max_ms
            );
        }
        if self.refresh_ms == 0 {
            bail!("--refresh-ms must be positive");
        }
        if self.poll_timeout_ms == 0 {
            bail!("--poll-timeout-ms must be positive");
        }

        let stop_grace = Duration::from_secs(self.stop_grace_secs);
        Ok(HarnessConfig {
            bootstrap,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            flush_timeout: stop_grace,
            consumer: ConsumerSettings {
                poll_timeout: Duration::from_millis(self.poll_timeout_ms),
                stop_grace,
                processing_min: Duration::from_millis(self.processing_min_ms),
                processing_max: Duration::from_millis(self.processing_max_ms),
                offset_reset: self.offset_reset,
            },
            tracker: TrackerSettings {
                refresh_interval: Duration::from_millis(self.refresh_ms),
                ..TrackerSettings::default()
            },
            log_capacity: self.log_capacity,
        })
    }
}

/// One operator command typed into the console
#[derive(Parser, Debug)]
#[command(no_binary_name = true, name = "ksessions>")]
pub struct ConsoleLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add or remove producers
    #[command(subcommand)]
    Producer(ProducerCommand),
    /// Add or remove consumer groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Add or remove consumers
    #[command(subcommand)]
    Consumer(ConsumerCommand),
    /// Show sessions, groups and progress
    Status {
        /// Print a JSON snapshot instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show recent log entries
    Logs {
        #[arg(value_enum)]
        stream: LogStream,
        /// Only entries from this source id
        #[arg(long)]
        source: Option<String>,
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        tail: usize,
    },
    /// Stop every session and exit
    #[command(alias = "exit")]
    Quit,
}

#[derive(Subcommand, Debug)]
pub enum ProducerCommand {
    /// Start a producer sending to a topic
    Add {
        #[arg(long)]
        topic: String,
        /// Minimum seconds between sends
        #[arg(long, default_value = "1")]
        min: f64,
        /// Maximum seconds between sends (exclusive)
        #[arg(long, default_value = "5")]
        max: f64,
        /// Message template; `{timestamp}` is replaced by the send time
        #[arg(long)]
        template: Option<String>,
    },
    /// Stop and remove a producer
    #[command(alias = "remove")]
    Rm { id: u64 },
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// Create a consumer group over comma separated topics
    Add { id: String, topics: String },
    /// Delete a consumer group without live consumers
    #[command(alias = "remove")]
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConsumerCommand {
    /// Start a consumer in an existing group, or an independent one over its own topics
    Add {
        #[arg(long, conflicts_with = "topics")]
        group: Option<String>,
        #[arg(long)]
        topics: Option<String>,
    },
    /// Stop and remove a consumer
    #[command(alias = "remove")]
    Rm { id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogStream {
    Producers,
    Consumers,
}

/// Splits a console line into words, keeping quoted sections together
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        bail!("unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build_config() {
        let args = Args::try_parse_from(["ksessions"]).unwrap();
        let config = args.harness_config().unwrap();
        assert_eq!(config.bootstrap, vec!["localhost:9092"]);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.consumer.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.consumer.stop_grace, Duration::from_secs(5));
        assert_eq!(config.tracker.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.log_capacity, 1000);
        assert!(!args.in_memory);
    }

    #[test]
    fn test_invalid_processing_range_rejected() {
        let args = Args::try_parse_from([
            "ksessions",
            "--processing-min-ms",
            "900",
            "--processing-max-ms",
            "100",
        ])
        .unwrap();
        assert!(args.harness_config().is_err());
    }

    #[test]
    fn test_offset_reset_flag() {
        let args = Args::try_parse_from(["ksessions", "--offset-reset", "latest", "--in-memory"]).unwrap();
        assert_eq!(args.harness_config().unwrap().consumer.offset_reset, OffsetReset::Latest);
        assert!(args.in_memory);
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"producer add --topic orders --template "sent at {timestamp}""#).unwrap(),
            vec!["producer", "add", "--topic", "orders", "--template", "sent at {timestamp}"]
        );
        assert_eq!(split_words("group add G1 't1, t2'").unwrap(), vec!["group", "add", "G1", "t1, t2"]);
        assert_eq!(split_words("  ").unwrap(), Vec::<String>::new());
        assert!(split_words("logs \"open").is_err());
    }

    #[test]
    fn test_console_commands_parse() {
        let line = ConsoleLine::try_parse_from(["producer", "add", "--topic", "orders", "--min", "1", "--max", "1"])
            .unwrap();
        match line.command {
            Command::Producer(ProducerCommand::Add { topic, min, max, template }) => {
                assert_eq!(topic, "orders");
                assert_eq!((min, max), (1.0, 1.0));
                assert!(template.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }

        let line = ConsoleLine::try_parse_from(["consumer", "add", "--group", "G1"]).unwrap();
        assert!(matches!(
            line.command,
            Command::Consumer(ConsumerCommand::Add { group: Some(_), topics: None })
        ));

        assert!(ConsoleLine::try_parse_from(["consumer", "add", "--group", "G1", "--topics", "t"]).is_err());
        assert!(matches!(
            ConsoleLine::try_parse_from(["exit"]).unwrap().command,
            Command::Quit
        ));
        assert!(matches!(
            ConsoleLine::try_parse_from(["logs", "consumers", "--tail", "5"]).unwrap().command,
            Command::Logs { stream: LogStream::Consumers, tail: 5, .. }
        ));
    }
}

//! Line-oriented operator console
//!
//! Reads commands from stdin until `quit`, end of input or Ctrl-C, then shuts
//! the registry down. Stdin is read on a plain thread so an interrupt never
//! waits for a pending read.

use anyhow::Result;
use clap::Parser;
use std::fmt::Write as _;
use std::future::Future;
use std::io::{BufRead, Write as _};
use tokio::sync::mpsc;
use tracing::info;

use crate::args::{split_words, Command, ConsoleLine, ConsumerCommand, GroupCommand, LogStream, ProducerCommand};
use ksessions::registry::{ConsumerMode, NewProducer, RegistryError, SessionRegistry};

type InputLine = std::io::Result<String>;

/// Result of executing one console line
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub output: String,
    pub quit: bool,
}

impl Reply {
    fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            quit: false,
        }
    }

    fn rejected(err: RegistryError) -> Self {
        Self::text(format!("error: {}", err))
    }
}

/// Runs the console until the operator quits, then stops every session
pub async fn run(registry: &mut SessionRegistry) -> Result<()> {
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    drive(registry, stdin_lines(), interrupted).await
}

/// Forwards stdin lines from a detached thread; the thread ends at EOF or once
/// the receiver is gone
fn stdin_lines() -> mpsc::Receiver<InputLine> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn drive<F>(registry: &mut SessionRegistry, mut lines: mpsc::Receiver<InputLine>, interrupted: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(interrupted);
    println!("ksessions console; type `help` for commands");

    loop {
        print!("ksessions> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = &mut interrupted => {
                println!();
                info!("interrupt received");
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let reply = execute(registry, &line?).await;
        if !reply.output.is_empty() {
            println!("{}", reply.output.trim_end());
        }
        if reply.quit {
            break;
        }
    }

    println!("Stopping all sessions...");
    registry.shutdown().await;
    Ok(())
}

/// Parses and executes one console line
pub async fn execute(registry: &mut SessionRegistry, line: &str) -> Reply {
    let words = match split_words(line) {
        Ok(words) if words.is_empty() => return Reply::default(),
        Ok(words) => words,
        Err(e) => return Reply::text(format!("error: {}", e)),
    };
    let command = match ConsoleLine::try_parse_from(words) {
        Ok(line) => line.command,
        // Also covers `help` and `--help`
        Err(e) => return Reply::text(e.to_string()),
    };

    match command {
        Command::Producer(ProducerCommand::Add { topic, min, max, template }) => {
            let request = NewProducer {
                topic,
                interval_min_secs: min,
                interval_max_secs: max,
                template,
            };
            match registry.add_producer(request).await {
                Ok(id) => Reply::text(describe_producer(registry, id)),
                Err(e) => Reply::rejected(e),
            }
        }
        Command::Producer(ProducerCommand::Rm { id }) => match registry.remove_producer(id).await {
            Ok(()) => Reply::text(format!("producer {} removed", id)),
            Err(e) => Reply::rejected(e),
        },
        Command::Group(GroupCommand::Add { id, topics }) => match registry.add_group(&id, &topics) {
            Ok(()) => Reply::text(format!("group {} created", id.trim())),
            Err(e) => Reply::rejected(e),
        },
        Command::Group(GroupCommand::Rm { id }) => match registry.remove_group(&id) {
            Ok(()) => Reply::text(format!("group {} removed", id)),
            Err(e) => Reply::rejected(e),
        },
        Command::Consumer(ConsumerCommand::Add { group, topics }) => {
            let mode = match (group, topics) {
                (_, Some(topics)) => ConsumerMode::Independent { topics },
                (group, None) => ConsumerMode::Grouped {
                    group: group.unwrap_or_default(),
                },
            };
            match registry.add_consumer(mode).await {
                Ok(id) => Reply::text(describe_consumer(registry, id)),
                Err(e) => Reply::rejected(e),
            }
        }
        Command::Consumer(ConsumerCommand::Rm { id }) => match registry.remove_consumer(id).await {
            Ok(()) => Reply::text(format!("consumer {} removed", id)),
            Err(e) => Reply::rejected(e),
        },
        Command::Status { json: true } => match serde_json::to_string_pretty(&registry.snapshot()) {
            Ok(json) => Reply::text(json),
            Err(e) => Reply::text(format!("error: {}", e)),
        },
        Command::Status { json: false } => Reply::text(render_status(registry)),
        Command::Logs { stream, source, tail } => {
            let buffer = match stream {
                LogStream::Producers => registry.producer_logs(),
                LogStream::Consumers => registry.consumer_logs(),
            };
            let mut out = String::new();
            for entry in buffer.tail(source.as_deref(), tail) {
                let _ = writeln!(out, "{}", entry);
            }
            Reply::text(out)
        }
        Command::Quit => Reply {
            output: String::new(),
            quit: true,
        },
    }
}

fn describe_producer(registry: &SessionRegistry, id: u64) -> String {
    match registry.producer(id) {
        Some(p) => format!("producer {} on '{}' is {}", id, p.topic(), p.state()),
        None => format!("producer {} added", id),
    }
}

fn describe_consumer(registry: &SessionRegistry, id: u64) -> String {
    match registry.consumer(id) {
        Some(c) => format!(
            "consumer {} in group {} on [{}] is {}",
            id,
            c.group(),
            c.topics().join(","),
            c.state()
        ),
        None => format!("consumer {} added", id),
    }
}

fn render_status(registry: &SessionRegistry) -> String {
    let snapshot = registry.snapshot();
    let mut out = String::new();

    let _ = writeln!(out, "Producers:");
    for p in &snapshot.producers {
        let _ = writeln!(
            out,
            "  #{:<4} {:<28} {:<8} sent={} failed={} every {}-{}s",
            p.id, p.source, p.state.to_string(), p.sent, p.failed, p.interval_min_secs, p.interval_max_secs
        );
    }

    let _ = writeln!(out, "Groups:");
    for g in &snapshot.groups {
        let _ = writeln!(
            out,
            "  {:<16} [{}] members={}{}",
            g.id,
            g.topics.join(","),
            g.members,
            if g.automatic { " (auto)" } else { "" }
        );
    }

    let _ = writeln!(out, "Consumers:");
    for c in &snapshot.consumers {
        let _ = writeln!(
            out,
            "  #{:<4} {:<28} {:<8} processed={}",
            c.id, c.source, c.state.to_string(), c.processed
        );
    }

    let _ = writeln!(out, "Progress:");
    for t in &snapshot.trackers {
        let _ = writeln!(out, "  {:<28} {:>12} {:>6.1}%", t.key, t.progress, t.percentage);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksessions::broker::MemoryBroker;
    use ksessions::config::HarnessConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(HarnessConfig::default(), Arc::new(MemoryBroker::new(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_commands() {
        let mut registry = registry();
        assert_eq!(execute(&mut registry, "group add G1 't1, t2'").await.output, "group G1 created");
        assert_eq!(
            execute(&mut registry, "group add G1 t3").await.output,
            "error: Consumer group ID existed"
        );
        assert_eq!(
            execute(&mut registry, "consumer add").await.output,
            "error: Must choose a consumer group"
        );

        let reply = execute(&mut registry, "consumer add --group G1").await;
        assert!(reply.output.starts_with("consumer 1 in group G1 on [t1,t2]"));
        assert_eq!(
            execute(&mut registry, "group rm G1").await.output,
            "error: Cannot delete consumer group: 1 consumer(s) alive"
        );

        let status = execute(&mut registry, "status").await.output;
        assert!(status.contains("G1|t1"));
        assert!(status.contains("G1|t2"));

        execute(&mut registry, "consumer rm 1").await;
        assert_eq!(execute(&mut registry, "group rm G1").await.output, "group G1 removed");
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_commands_and_logs() {
        let mut registry = registry();
        let reply = execute(&mut registry, "producer add --topic orders --min 1 --max 1 --template hi").await;
        assert_eq!(reply.output, "producer 1 on 'orders' is running");

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        let logs = execute(&mut registry, "logs producers --tail 1").await.output;
        assert!(logs.contains("Message=hi"));

        let json = execute(&mut registry, "status --json").await.output;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["producers"][0]["topic"], "orders");

        assert_eq!(execute(&mut registry, "producer rm 1").await.output, "producer 1 removed");
        assert_eq!(execute(&mut registry, "producer rm 1").await.output, "error: Unknown producer 1");
    }

    #[tokio::test]
    async fn test_quit_and_parse_errors() {
        let mut registry = registry();
        assert!(execute(&mut registry, "quit").await.quit);
        assert_eq!(execute(&mut registry, "   ").await, Reply::default());
        assert!(!execute(&mut registry, "bogus").await.output.is_empty());
        assert!(execute(&mut registry, "help").await.output.contains("producer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_ends_console_while_input_is_pending() {
        let mut registry = registry();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("group add G1 t1".to_string())).await.unwrap();
        tx.send(Ok("consumer add --group G1".to_string())).await.unwrap();

        // The sender stays open, like a terminal nobody is typing into
        drive(&mut registry, rx, time::sleep(Duration::from_secs(1))).await.unwrap();
        assert_eq!(registry.consumers().count(), 0);
        assert_eq!(registry.group("G1").unwrap().member_count(), 0);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_input_ends_console() {
        let mut registry = registry();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok("producer add --topic orders --min 1 --max 1".to_string()))
            .await
            .unwrap();
        drop(tx);

        drive(&mut registry, rx, std::future::pending()).await.unwrap();
        assert_eq!(registry.producers().count(), 0);
    }
}


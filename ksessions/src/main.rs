//! ksessions - interactive console for Kafka producer and consumer sessions
//!
//! Starts an empty session registry against a Kafka cluster (or the embedded
//! in-memory broker) and hands control to the operator console.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

mod args;
mod console;

use args::Args;
use ksessions::{BrokerConnector, KafkaConnector, MemoryBroker, SessionRegistry};

/// Initialize tracing subscriber for structured logging
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.quiet);
    let config = args.harness_config()?;

    let connector: Arc<dyn BrokerConnector> = if args.in_memory {
        info!(partitions = args.memory_partitions, "using in-memory broker");
        Arc::new(MemoryBroker::new(args.memory_partitions))
    } else {
        info!(bootstrap = ?config.bootstrap, "using Kafka broker");
        Arc::new(KafkaConnector::new(config.bootstrap.clone(), config.send_timeout))
    };

    let mut registry = SessionRegistry::new(config, connector);
    console::run(&mut registry).await?;
    info!("all sessions stopped");
    Ok(())
}

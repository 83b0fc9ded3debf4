//! CLI for durapub
//!
//! Subcommands:
//! - `serve`: run the delivery workers and the retry scheduler until a
//!   termination signal arrives
//! - `create-topic`, `subscribe`, `unsubscribe`: topic administration
//! - `publish`: publish one JSON payload and wait for its first attempt
//! - `status`: message counts per state and the known topics
//! - `show`: one stored message with its delivery records
//! - `retry`: run one retry cycle now

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use durapub::broker::{Broker, MessageState, Topic, TopicRegistry, load_message};
use durapub::config::{Settings, load_config, load_config_from};
use durapub::persistence::QueueStore;
use durapub::transport::HttpDeliverer;
use durapub::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "durapub", about = "Durable topic fan-out over HTTP")]
struct Cli {
    /// Configuration file (extension optional); defaults to `config/default`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the delivery engine until SIGINT/SIGTERM
    Serve,
    /// Create a topic with an allow-list of senders
    CreateTopic {
        identifier: String,
        #[arg(long = "allow")]
        allowed_senders: Vec<String>,
    },
    /// Subscribe an endpoint URL to a topic
    Subscribe {
        topic: String,
        url: String,
        #[arg(long)]
        sender: String,
    },
    /// Remove an endpoint URL from a topic
    Unsubscribe { topic: String, url: String },
    /// Publish a JSON payload to a topic
    Publish {
        topic: String,
        payload: String,
        #[arg(long)]
        sender: String,
    },
    /// Show message counts per state and the known topics
    Status,
    /// Print one stored message as JSON
    Show { message_id: String },
    /// Retry every failed message once
    Retry,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match cli.config.as_ref() {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.log.level);

    if let Err(e) = run(cli.command, &settings).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve => serve(settings).await,
        Command::CreateTopic {
            identifier,
            allowed_senders,
        } => {
            let registry = open_registry(settings)?;
            let mut topic = Topic::new(&identifier);
            topic.allowed_senders = allowed_senders.into_iter().collect::<BTreeSet<_>>();
            let topic = registry.create_topic(topic)?;
            println!("created topic {}", topic.identifier);
            Ok(())
        }
        Command::Subscribe { topic, url, sender } => {
            let outcome = open_registry(settings)?.subscribe(&topic, &url, &sender)?;
            println!("{outcome:?}");
            Ok(())
        }
        Command::Unsubscribe { topic, url } => {
            open_registry(settings)?.unsubscribe(&topic, &url)?;
            Ok(())
        }
        Command::Publish {
            topic,
            payload,
            sender,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let broker = open(settings)?;
            let outcome = broker.publish(&topic, payload, &sender)?;
            println!(
                "message '{}' accepted for {} subscriber(s)",
                outcome.message_id(),
                outcome.subscriber_count()
            );
            broker.drain().await;
            Ok(())
        }
        Command::Status => {
            let store = QueueStore::open(&settings.store.data_dir)?;
            for state in MessageState::ALL {
                println!("{state:>6}: {}", store.count_messages(state));
            }
            for topic in store.list_topics()? {
                println!(
                    "topic {} ({} subscriber(s), {} allowed sender(s))",
                    topic.identifier,
                    topic.subscriptions.len(),
                    topic.allowed_senders.len()
                );
            }
            Ok(())
        }
        Command::Show { message_id } => {
            let store = QueueStore::open(&settings.store.data_dir)?;
            let message = load_message(&store, &message_id)?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            Ok(())
        }
        Command::Retry => {
            let broker = open(settings)?;
            let report = broker.retry_now().await;
            println!("{report:?}");
            broker.drain().await;
            Ok(())
        }
    }
}

/// Topic administration only needs the store; no workers are started.
fn open_registry(settings: &Settings) -> Result<TopicRegistry, Box<dyn std::error::Error>> {
    let store = Arc::new(QueueStore::open(&settings.store.data_dir)?);
    Ok(TopicRegistry::new(store))
}

fn open(settings: &Settings) -> Result<Broker, Box<dyn std::error::Error>> {
    let store = Arc::new(QueueStore::open(&settings.store.data_dir)?);
    let deliverer = Arc::new(HttpDeliverer::from_settings(&settings.delivery)?);
    Ok(Broker::new(store, deliverer, &settings.delivery)?)
}

async fn serve(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::start(settings)?;
    info!(data_dir = %settings.store.data_dir, "durapub running");

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    broker.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

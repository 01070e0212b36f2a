pub mod config;
pub mod console;
pub mod mqtt;
pub mod persistence;

use crate::config::AppConfig;
use crate::console::Console;
use crate::mqtt::ConnectionManager;
use crate::persistence::{CommandCatalog, JsonlMessageLog};
use color_eyre::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = AppConfig::resolve_path(std::env::args().nth(1));
    let config = AppConfig::ensure_default_config(&config_path).await?;
    info!(
        "Loaded config from {}, broker {}",
        config_path.display(),
        config.mqtt.broker_addr()
    );

    let message_log = Arc::new(JsonlMessageLog::new(config.store.message_log_path()));
    info!("Recording messages to {}", message_log.path().display());

    // One manager for the whole process, handed to everything that needs it
    let manager = ConnectionManager::from_config(&config.mqtt, message_log.clone());
    manager.connect().await;
    for topic in &config.mqtt.subscriptions {
        manager.subscribe(topic).await;
    }

    let catalog = CommandCatalog::new(config.commands.clone());
    info!("{} saved command(s) available", catalog.iter().count());
    let console = Console::new(manager.clone(), catalog, message_log);

    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console.run(input, tokio::io::stdout()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    manager.close().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    // stdout belongs to the console, logs go to stderr
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

use color_eyre::{eyre::eyre, Result};
use mqtt_relay::delivery::ConsoleNotifier;
use mqtt_relay::mqtt::RumqttFactory;
use mqtt_relay::relay::Inbox;
use mqtt_relay::{Relay, RelayConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Reads `<user> <text>` lines from stdin and answers on stdout as `@<user> <text>`
#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = RelayConfig::default_path();
    let config = RelayConfig::load_or_create(&config_path).await?;

    let (relay, pump) = Relay::spawn(
        &config,
        Arc::new(RumqttFactory),
        Arc::new(ConsoleNotifier::new()),
    );
    info!(
        "Relay ready, directives start with `{}`",
        config.command_prefix
    );

    let mut inbox = Inbox::new(relay.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| eyre!("Failed to read stdin: {}", e))?
    {
        let Some((user, text)) = split_line(&line) else {
            if !line.trim().is_empty() {
                warn!("Ignoring line without user: {}", line);
            }
            continue;
        };

        inbox.push(user, text).await;
    }

    info!("Input closed, shutting down");
    inbox.close().await;
    relay.shutdown().await;
    if let Err(e) = pump.await {
        debug!("Message pump ended abnormally: {}", e);
    }
    Ok(())
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    let (user, text) = line.trim().split_once(char::is_whitespace)?;
    Some((user, text.trim_start()))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

// stdout carries the chat traffic, logs go to stderr
fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

// `RUST_LOG` directives, `info` when unset
fn log_filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::new(directives.unwrap_or("info"))
}

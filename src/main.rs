//! IoT Hub device client - receive sample
//!
//! Connects with a device connection string, enables cloud-to-device messages
//! and prints each one until `q` is entered or Ctrl-C is pressed.

use clap::Parser;
use iothub_device::config::ClientConfig;
use iothub_device::observability::init_default_logging;
use iothub_device::{DeviceClient, InboundMessage, MessageStream};
use std::path::PathBuf;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// Receive cloud-to-device messages as an IoT Hub device
#[derive(Parser)]
#[command(name = "iothub-device")]
#[command(version)]
struct Cli {
    /// Device connection string
    #[arg(long, env = "IOTHUB_DEVICE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    if let Err(e) = run(cli).await {
        error!("Device client failed: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load_or_default(cli.config.as_deref())?;
    config.validate()?;

    // An explicit argument wins over the configured environment variable
    let connection_string = match cli.connection_string {
        Some(connection_string) => connection_string,
        None => config.connection_string_from_env()?,
    };

    let client = DeviceClient::from_connection_string(&connection_string, config)?;
    client.on_connection_state(|state| println!("connection status: {state}"));

    client.connect().await?;
    client.enable_feature("c2d").await?;
    info!(client_id = %client.identity().client_id(), "Receiving cloud-to-device messages");

    let consumer = tokio::spawn(print_messages(client.messages()?));

    println!("Enter 'q' to quit");
    tokio::select! {
        _ = wait_for_quit() => {}
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    client.disconnect().await?;
    if let Err(e) = consumer.await {
        warn!("Message consumer ended abnormally: {}", e);
    }
    Ok(())
}

async fn wait_for_quit() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => return,
            Ok(Some(_)) => continue,
            // Closed stdin leaves Ctrl-C as the only way out
            Ok(None) => std::future::pending::<()>().await,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                std::future::pending::<()>().await
            }
        }
    }
}

async fn print_messages(mut messages: MessageStream) {
    while let Some(message) = messages.next().await {
        print_message(&message);
    }
    info!("Message stream ended");
}

fn print_message(message: &InboundMessage) {
    println!("message received: {}", message.data_lossy());
    if !message.custom_properties.is_empty() {
        match serde_json::to_string(&message.custom_properties) {
            Ok(properties) => println!("  properties: {properties}"),
            Err(e) => warn!("Failed to format message properties: {}", e),
        }
    }
}

//! `murmur client`: talks to a relay chat server.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use murmur_network::message::Common;
use murmur_network::{Client, Codec, NetworkConfig};

pub async fn run(
    server_addr: &str,
    codec: Arc<dyn Codec<Common>>,
    config: &NetworkConfig,
) -> Result<()> {
    let client = Client::connect_with_config(server_addr, codec, config)
        .await
        .with_context(|| format!("Failed to connect to server {server_addr}"))?;
    println!("Connected to {server_addr}. Type to chat.");

    let receiver = client.clone();
    let mut receive_task = tokio::spawn(async move {
        receiver
            .handle(|msg: Common| async move {
                if let Some(line) = render(&msg) {
                    println!("{line}");
                }
            })
            .await
    });

    let mut lines = crate::stdin_lines();
    loop {
        tokio::select! {
            _ = &mut receive_task => {
                println!("Server closed the connection.");
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match client.send(&Common::text("", line.clone())).await {
                    Ok(()) => println!("You: {line}"),
                    Err(e) => warn!("Error sending message: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

/// How a relayed message is shown.
fn render(msg: &Common) -> Option<String> {
    let message = msg.message.as_ref()?;
    Some(match &message.media {
        Some(media) => format!("{}: [File {}]", message.from.name, media.filename),
        None => format!("{}: {}", message.from.name, message.text),
    })
}

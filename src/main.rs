use std::sync::Arc;

use async_trait::async_trait;
use rustalink_client::{
    Client, ClientEvent,
    common::{logger, types::{AnyResult, GuildId}},
    configs::Config,
    storage::MemoryStore,
    voice::VoiceRelay,
};
use tracing::{error, info, warn};

/// Stand-in relay for running without a chat gateway: payloads are only
/// logged, so voice handshakes time out.
struct LoggingRelay;

#[async_trait]
impl VoiceRelay for LoggingRelay {
    async fn send(&self, guild_id: &GuildId, payload: serde_json::Value) -> AnyResult<()> {
        info!("[{}] Voice payload: {}", guild_id, payload);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(config.logging.as_ref());

    let client = Client::new(&config, Arc::new(LoggingRelay), Arc::new(MemoryStore::new()))?;
    let events = client.events();
    client.connect().await;

    loop {
        tokio::select! {
            event = events.recv_async() => match event {
                Ok(ClientEvent::Debug { message }) => tracing::debug!("{}", message),
                Ok(ClientEvent::NodeError { node, error }) => error!("[{}] {}", node, error),
                Ok(ClientEvent::NodeDestroy { node, reason }) => {
                    warn!("[{}] Node destroyed: {}", node, reason);
                    if client.nodes().is_empty() {
                        error!("No nodes left");
                        break;
                    }
                }
                Ok(event) => info!("{:?}", event),
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }

    client.shutdown();
    Ok(())
}

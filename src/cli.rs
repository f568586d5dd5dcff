use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::protocol::ClientMessage;

#[derive(Parser, Debug)]
#[command(name = "sync-hub")]
#[command(about = "Real-time sync coordinator and connector probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect as a connector, open a session, and tail the tenant's events
    Probe {
        /// Coordinator URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Tenant to attach to
        #[arg(short, long)]
        tenant: String,

        /// Connector id to present
        #[arg(short, long)]
        connector: Option<String>,

        /// Seconds between heartbeats
        #[arg(long, default_value_t = 60)]
        heartbeat: u64,
    },
}

pub async fn run_probe(
    url: String,
    tenant: String,
    connector: Option<String>,
    heartbeat_secs: u64,
) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the coordinator running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let start = ClientMessage::SyncStart {
        tenant_id: tenant.clone(),
        connector_id: connector,
    };
    write
        .send(Message::Text(serde_json::to_string(&start)?.into()))
        .await?;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = serde_json::to_string(&ClientMessage::Heartbeat)?;
                write.send(Message::Text(ping.into())).await?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => println!("{}", text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("coordinator closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}

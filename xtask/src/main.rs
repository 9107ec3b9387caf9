use anyhow::{bail, Result};
use campus_core::connector::{Connector, MemoryConnector};
use campus_core::models::UserProfile;
use campus_core::{telemetry, CampusClient, ClientConfig, Session, SessionStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Campus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the session, realtime channel and chat cache against an in-memory server.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let config = ClientConfig::for_api("http://127.0.0.1:9/api", temp_dir.path().to_path_buf())?;
    let store = SessionStore::new(temp_dir.path().to_path_buf());
    let connector = Arc::new(MemoryConnector::new());
    let client = CampusClient::with_parts(
        config,
        store,
        connector.clone() as Arc<dyn Connector>,
    )?;

    client.auth().establish(Session {
        access_token: "smoke-access".into(),
        refresh_token: Some("smoke-refresh".into()),
        user: Some(UserProfile {
            id: "parent-1".into(),
            name: "Smoke Parent".into(),
            email: None,
            role: None,
        }),
    })?;

    runtime.block_on(async {
        let chat = client.open_chat()?;
        client.connect_realtime().await?;
        let Some(peer) = connector.latest() else {
            bail!("in-memory server never saw a connection");
        };

        let sent = [("m-1", "hello"), ("m-2", "how are you")];
        for (id, content) in sent {
            peer.push(
                "newMessage",
                json!({
                    "id": id,
                    "senderId": "teacher-1",
                    "receiverId": "parent-1",
                    "content": content,
                    "createdAt": Utc::now(),
                    "isRead": false,
                }),
            );
        }

        for _ in 0..50 {
            if chat.messages("teacher-1").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = chat.messages("teacher-1");
        info!(
            "messages" = messages.len(),
            "unread" = chat.total_unread(),
            "smoke test conversation cached"
        );
        let cached: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<&str> = sent.iter().map(|(_, content)| *content).collect();
        if cached != expected {
            bail!("expected cached conversation {expected:?}, found {cached:?}");
        }

        client.channel().disconnect();
        Ok(())
    })
}

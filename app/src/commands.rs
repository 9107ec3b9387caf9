use crate::config::{save_cli_settings, CliSettings};
use anyhow::{anyhow, Context as _, Result};
use campus_core::channel::ConnectionState;
use campus_core::models::{AvailableUser, ConversationSummary, Message};
use campus_core::protocol::InboundEvent;
use campus_core::{CampusClient, ChatStore};
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and store the session.
    Login {
        email: String,
        #[arg(long, env = "CAMPUS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Show the signed-in account.
    Whoami,
    /// List conversations with their unread counts.
    Conversations,
    /// Print the history of one conversation (defaults to the last one opened).
    Messages { user: Option<String> },
    /// Send a message.
    Send {
        user: String,
        #[arg(required = true, num_args = 1..)]
        content: Vec<String>,
    },
    /// Mark a conversation as read.
    Read { user: String },
    /// List users you can message, with presence.
    Users,
    /// Stay connected and print realtime events until interrupted.
    Watch { user: Option<String> },
}

pub struct CommandContext {
    pub client: CampusClient,
    pub settings: CliSettings,
    pub settings_path: PathBuf,
}

pub async fn run(command: Command, mut ctx: CommandContext) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let session = ctx.client.login(&email, &password).await?;
            let name = session
                .user
                .map(|user| user.name)
                .unwrap_or_else(|| email.clone());
            println!("Signed in as {name}");
        }
        Command::Logout => {
            ctx.client.logout().await;
            println!("Signed out");
        }
        Command::Whoami => match ctx.client.session().and_then(|s| s.user) {
            Some(user) => println!("{} <{}> ({})", user.name, user.id, role_label(&user.role)),
            None => println!("Not signed in"),
        },
        Command::Conversations => {
            let chat = ctx.client.open_chat()?;
            let conversations = chat.fetch_conversations().await?;
            if conversations.is_empty() {
                println!("No conversations yet");
            }
            for summary in &conversations {
                println!("{}", format_summary(summary));
            }
        }
        Command::Messages { user } => {
            let chat = ctx.client.open_chat()?;
            let other = resolve_conversation(user, &ctx.settings)?;
            let messages = chat.fetch_messages(&other).await?;
            for message in &messages {
                println!(
                    "{}",
                    format_message(message, chat.self_id(), ctx.settings.show_timestamps)
                );
            }
            remember(&mut ctx, &other).await?;
        }
        Command::Send { user, content } => {
            let chat = ctx.client.open_chat()?;
            let content = content.join(" ");
            match chat.send_message(&user, &content).await? {
                Some(stored) => println!("Sent ({})", stored.id),
                None => println!("Nothing to send"),
            }
            remember(&mut ctx, &user).await?;
        }
        Command::Read { user } => {
            let chat = ctx.client.open_chat()?;
            chat.mark_as_read(&user).await?;
            println!("Marked conversation with {user} as read");
        }
        Command::Users => {
            let chat = ctx.client.open_chat()?;
            chat.fetch_available_users().await?;
            for user in chat.available_users() {
                println!("{}", format_user(&user));
            }
        }
        Command::Watch { user } => {
            let chat = ctx.client.open_chat()?;
            let other = user.or_else(|| ctx.settings.last_conversation.clone());
            watch(&ctx.client, &chat, other.as_deref(), ctx.settings.show_timestamps).await?;
        }
    }
    Ok(())
}

async fn watch(
    client: &CampusClient,
    chat: &ChatStore,
    other: Option<&str>,
    show_timestamps: bool,
) -> Result<()> {
    let channel = client.channel();
    let self_id = chat.self_id().to_string();
    channel.on_server_event(move |event| {
        if let Some(line) = format_event(&event, &self_id, show_timestamps) {
            println!("{line}");
        }
    });
    channel.on_disconnect(|reason| println!("disconnected: {reason}"));

    client
        .connect_realtime()
        .await
        .context("realtime connection failed")?;
    if let Some(other) = other {
        chat.set_current_conversation(Some(other));
        chat.fetch_messages(other).await?;
        println!("Watching conversation with {other}. Ctrl-C to stop.");
    } else {
        println!("Watching all events. Ctrl-C to stop.");
    }

    let mut status = channel.subscribe_status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
        }
        _ = status.wait_for(|status| status.state == ConnectionState::Disconnected) => {}
    }
    chat.set_current_conversation(None);
    channel.disconnect();
    Ok(())
}

fn resolve_conversation(user: Option<String>, settings: &CliSettings) -> Result<String> {
    user.or_else(|| settings.last_conversation.clone())
        .ok_or_else(|| anyhow!("name a user; no conversation has been opened yet"))
}

async fn remember(ctx: &mut CommandContext, other: &str) -> Result<()> {
    if ctx.settings.last_conversation.as_deref() == Some(other) {
        return Ok(());
    }
    ctx.settings.last_conversation = Some(other.to_string());
    save_cli_settings(&ctx.settings_path, &ctx.settings).await
}

fn role_label(role: &Option<campus_core::models::UserRole>) -> String {
    role.as_ref()
        .map(|role| format!("{role:?}").to_lowercase())
        .unwrap_or_else(|| "unknown role".to_string())
}

pub fn format_message(message: &Message, self_id: &str, show_timestamps: bool) -> String {
    let who = if message.sender_id == self_id {
        "you".to_string()
    } else {
        message.sender_id.clone()
    };
    let pending = if message.is_local() { " (sending)" } else { "" };
    if show_timestamps {
        format!(
            "[{}] {who}: {}{pending}",
            message.created_at.format("%Y-%m-%d %H:%M"),
            message.content
        )
    } else {
        format!("{who}: {}{pending}", message.content)
    }
}

/// One line per realtime event worth showing; own-message echoes are skipped.
pub fn format_event(event: &InboundEvent, self_id: &str, show_timestamps: bool) -> Option<String> {
    match event {
        InboundEvent::NewMessage(message) => {
            Some(format_message(message, self_id, show_timestamps))
        }
        InboundEvent::MessageSent(_) => None,
        InboundEvent::UserTyping(typing) if typing.is_typing => {
            Some(format!("… {} is typing", typing.user_name))
        }
        InboundEvent::UserTyping(_) => None,
        InboundEvent::UserOnline(online) => Some(format!("+ {} is online", online.name)),
        InboundEvent::UserOffline(offline) => Some(format!("- {} went offline", offline.user_id)),
    }
}

pub fn format_summary(summary: &ConversationSummary) -> String {
    let preview = summary
        .last_message
        .as_ref()
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let unread = if summary.unread_count > 0 {
        format!(" [{} unread]", summary.unread_count)
    } else {
        String::new()
    };
    format!(
        "{} ({}){unread}: {preview}",
        summary.user.name, summary.user.id
    )
}

pub fn format_user(user: &AvailableUser) -> String {
    let marker = if user.is_online { "●" } else { "○" };
    format!("{marker} {} ({})", user.user.name, user.user.id)
}

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatClient, ClientEvent, ClientHandle, Credentials, JsonFileStore,
    KeyValueStore, LogNotifier, MemoryStore,
};
use shared::domain::{ChannelId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal front end for the chat engine. Settings come from
/// `client.toml` and the environment; flags win over both.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    api_base_url: Option<String>,
    /// Where the session survives restarts. Without it the session lives in
    /// memory only.
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, requires = "username")]
    password: Option<String>,
    /// Device-bound identity for password-less login.
    #[arg(long)]
    auto_login_id: Option<String>,
}

const HELP: &str = "\
commands:
  /channels                  list channels with unread counts
  /select <id>               switch channel
  /create <name>             create a channel
  /group <name> <user>...    create a group channel
  /rename <id> <name>        rename a channel
  /remove-channel <id>       delete a channel
  /add <id> <user>...        add members to a group
  /kick <id> <user>...       remove members from a group
  /members                   roster of the selected channel
  /online                    connected users
  /reply <message id>        reply to a message on the next send
  /cancel                    drop the reply context
  /delete <message id>       delete a message
  /logout
  /quit
anything else is sent to the selected channel";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if args.api_base_url.is_some() {
        settings.api_base_url = args.api_base_url;
    }
    if args.session_file.is_some() {
        settings.session_file = args.session_file;
    }

    let store: Arc<dyn KeyValueStore> = match &settings.session_file {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("failed to open session file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let client = ChatClient::new(&settings, store, Arc::new(LogNotifier))?;
    println!("server: {}", client.api_base_url().await);

    let printer = tokio::spawn(print_events(Arc::clone(&client)));

    let logged_in = if let (Some(username), Some(password)) = (args.username, args.password) {
        client.login(Credentials::new(username, password)).await?;
        true
    } else if let Some(id) = args.auto_login_id.as_deref() {
        client.auto_login(id).await || client.resume().await
    } else {
        client.resume().await
    };
    if !logged_in {
        return Err(anyhow!(
            "no session: pass --username/--password or --auto-login-id"
        ));
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&client, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("error: {err:#}"),
        }
    }

    client.disconnect().await;
    printer.abort();
    Ok(())
}

/// Returns false when the session ends.
async fn run_command(client: &Arc<ChatClient>, line: &str) -> Result<bool> {
    if !line.starts_with('/') {
        client.send_message(line).await?;
        return Ok(true);
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    match command {
        "/quit" => return Ok(false),
        "/logout" => {
            ClientHandle::logout(client).await;
            return Ok(false);
        }
        "/help" => println!("{HELP}"),
        "/channels" => {
            let selected = client.selected_channel_id().await;
            let counts = client.unread_counts().await;
            for channel in client.channels().await {
                let marker = if selected == Some(channel.id) { "*" } else { " " };
                let unread = counts.get(&channel.id).copied().unwrap_or(0);
                let kind = if channel.is_group { "group" } else { "direct" };
                println!("{marker} {} {} ({kind}) unread={unread}", channel.id, channel.name);
            }
        }
        "/select" => client.select_channel(channel_arg(&rest, 0)?).await?,
        "/create" => client.create_channel(&rest.join(" ")).await?,
        "/group" => {
            let name = rest.first().ok_or_else(|| anyhow!("usage: /group <name> <user>..."))?;
            client.create_group_channel(name, &user_args(&rest[1..])).await?;
        }
        "/rename" => {
            let id = channel_arg(&rest, 0)?;
            client.rename_channel(id, &rest[1..].join(" ")).await?;
        }
        "/remove-channel" => client.delete_channel(channel_arg(&rest, 0)?).await?,
        "/add" => {
            let id = channel_arg(&rest, 0)?;
            client.add_members(id, &user_args(&rest[1..])).await?;
        }
        "/kick" => {
            let id = channel_arg(&rest, 0)?;
            client.remove_members(id, &user_args(&rest[1..])).await?;
        }
        "/members" => {
            for user in client.members_for_selected_channel().await {
                println!("  {} ({})", user.username, user.id);
            }
        }
        "/online" => {
            for user in client.online_users().await {
                println!("  {}", user.username);
            }
        }
        "/reply" => {
            let id = message_arg(&rest)?;
            let message = client
                .messages_for_selected_channel()
                .await
                .into_iter()
                .find(|m| m.id == id)
                .ok_or_else(|| anyhow!("message {id} is not in the selected channel"))?;
            client.start_reply(message).await;
        }
        "/cancel" => client.cancel_reply().await,
        "/delete" => client.delete_message(message_arg(&rest)?).await?,
        other => println!("unknown command {other}, try /help"),
    }
    Ok(true)
}

fn channel_arg(args: &[&str], index: usize) -> Result<ChannelId> {
    let raw = args.get(index).ok_or_else(|| anyhow!("missing channel id"))?;
    Ok(ChannelId(raw.parse().with_context(|| format!("bad channel id '{raw}'"))?))
}

fn message_arg(args: &[&str]) -> Result<MessageId> {
    let raw = args.first().ok_or_else(|| anyhow!("missing message id"))?;
    Ok(MessageId(raw.parse().with_context(|| format!("bad message id '{raw}'"))?))
}

fn user_args(args: &[&str]) -> Vec<UserId> {
    args.iter().map(|id| UserId::new(*id)).collect()
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("ui: skipped {skipped} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ClientEvent::MessagesUpdated { channel_id }
                if client.selected_channel_id().await == Some(channel_id) =>
            {
                if let Some(message) = client.messages(channel_id).await.last() {
                    let reply = message
                        .reply_to_id
                        .map(|id| format!(" (re {id})"))
                        .unwrap_or_default();
                    println!(
                        "[{}] #{} {}{reply}: {}",
                        message.timestamp.format("%H:%M"),
                        message.id,
                        message.user,
                        message.text
                    );
                }
            }
            ClientEvent::SelectionChanged(Some(channel_id)) => {
                let name = client
                    .selected_channel()
                    .await
                    .map(|c| c.name)
                    .unwrap_or_default();
                println!("-- now in {channel_id} {name}");
            }
            ClientEvent::ReplyContextChanged => match client.reply_context().await {
                Some(message) => println!("-- replying to {}: {}", message.user, message.text),
                None => println!("-- reply cleared"),
            },
            ClientEvent::ConnectionStateChanged(state) => println!("-- connection {state:?}"),
            ClientEvent::Notice(text) => println!("-- {text}"),
            ClientEvent::Error(text) => println!("!! {text}"),
            ClientEvent::SessionChanged { authenticated } => {
                println!("-- {}", if authenticated { "logged in" } else { "logged out" });
            }
            _ => {}
        }
    }
}

//! `livechat`: headless driver for the client core.
//!
//! Reads commands from stdin and prints chat activity to stdout. Logs go
//! to stderr, or to a file with `--log-file`.
//!
//! ```bash
//! livechat --server-url ws://127.0.0.1:8080/socket --user-id alice --token "$TOKEN"
//!
//! # Or via environment variables
//! LIVECHAT_SERVER_URL=ws://127.0.0.1:8080/socket LIVECHAT_USER_ID=alice \
//!     LIVECHAT_TOKEN=... livechat
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

use livechat::api::http::HttpChatApi;
use livechat::chat::CacheEvent;
use livechat::client::ChatClient;
use livechat::config::{CliArgs, ClientConfig, SessionConfig};
use livechat::recovery::LifecycleEvent;
use livechat::transport::AuthToken;
use livechat::transport::websocket::WebSocketTransport;
use livechat_proto::message::{ChatId, MessageId, UserId};

type Client = ChatClient<WebSocketTransport, HttpChatApi>;

const HELP: &str = "\
commands:
  /open <chat>          switch to a chat and load its messages
  /chats                list chats
  /retry <message>      retry a failed message in the open chat
  /delete <message>     delete a message in the open chat
  /online               list online users
  /status               show connection state and pending messages
  /wake                 simulate the window becoming visible
  /quit                 exit
  <text>                send to the open chat";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };
    let Some(session) = config.session() else {
        eprintln!("--server-url, --user-id and --token are required (see --help)");
        std::process::exit(2);
    };

    let client = match build_client(&config, &session) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("failed to set up client: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(user_id = %session.user_id, server = %session.server_url, "livechat starting");
    let state = client.start(AuthToken::new(session.token.clone())).await;
    println!("connection: {state}");

    let printer = tokio::spawn(print_activity(Arc::clone(&client)));
    let result = run_repl(&client).await;

    client.shutdown().await;
    printer.abort();
    tracing::info!("livechat exiting");
    result
}

fn build_client(config: &ClientConfig, session: &SessionConfig) -> Result<Client, livechat::api::ApiError> {
    let transport = WebSocketTransport::new(session.server_url.clone())
        .with_timeouts(config.connect_timeout, config.handshake_timeout)
        .with_buffer(config.channel_capacity);
    let api = HttpChatApi::new(session.api_url.clone(), AuthToken::new(session.token.clone()))?;
    Ok(ChatClient::new(
        transport,
        Arc::new(api),
        UserId::new(session.user_id.clone()),
        config.settings,
    ))
}

/// Initialize logging to stderr, or to `file_path` if given.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(ChatId),
    Chats,
    Retry(MessageId),
    Delete(MessageId),
    Online,
    Status,
    Wake,
    Help,
    Quit,
    Send(String),
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };
        let (name, arg) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(n, a)| (n, a.trim()));
        let required = |what: &str| {
            if arg.is_empty() {
                Err(format!("/{name} needs a {what}"))
            } else {
                Ok(arg.to_string())
            }
        };
        match name {
            "open" => required("chat id").map(|a| Self::Open(ChatId::new(a))),
            "chats" => Ok(Self::Chats),
            "retry" => required("message id").map(|a| Self::Retry(MessageId::new(a))),
            "delete" => required("message id").map(|a| Self::Delete(MessageId::new(a))),
            "online" => Ok(Self::Online),
            "status" => Ok(Self::Status),
            "wake" => Ok(Self::Wake),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command /{other}")),
        }
    }
}

async fn run_repl(client: &Client) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open: Option<ChatId> = None;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(c) => c,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match command {
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Open(chat_id) => {
                match client.open_chat(&chat_id).await {
                    Ok(_) => {
                        for m in client.cache().messages(&chat_id).iter().rev() {
                            println!("[{}] {}: {} ({})", m.id, m.sender.id, m.content, m.status);
                        }
                    }
                    Err(e) => println!("could not load {chat_id}: {e}"),
                }
                open = Some(chat_id);
            }
            Command::Chats => {
                if let Err(e) = client.refresh_chats().await {
                    println!("refresh failed: {e}");
                }
                for chat in client.directory().chats() {
                    println!("{} {}", chat.id, chat.name.as_deref().unwrap_or("(direct)"));
                }
            }
            Command::Online => {
                let state = client.presence().snapshot();
                let ids: Vec<String> = state.online_user_ids.iter().map(ToString::to_string).collect();
                println!("online: {}", ids.join(", "));
            }
            Command::Status => println!(
                "connection: {}, pending: {}",
                client.state(),
                client.delivery().queue().len()
            ),
            Command::Wake => {
                client.notify(LifecycleEvent::Visible);
            }
            Command::Retry(id) => match &open {
                Some(chat_id) => match client.retry_message(chat_id, &id).await {
                    Ok(status) => println!("{id}: {status}"),
                    Err(e) => println!("retry failed: {e}"),
                },
                None => println!("open a chat first"),
            },
            Command::Delete(id) => match &open {
                Some(chat_id) => {
                    if let Err(e) = client.delete_message(chat_id, &id).await {
                        println!("delete failed: {e}");
                    }
                }
                None => println!("open a chat first"),
            },
            Command::Send(text) => {
                let Some(chat_id) = &open else {
                    println!("open a chat first");
                    continue;
                };
                match client.send_message(chat_id.clone(), text, None).await {
                    Ok(m) => println!("[{}] {}", m.id, m.status),
                    Err(e) => println!("not sent: {e}"),
                }
            }
        }
    }
    Ok(())
}

/// Prints cache changes and connection state transitions.
async fn print_activity(client: Arc<Client>) {
    let mut cache = client.cache().subscribe();
    let mut state = client.connection().watch_state();
    loop {
        tokio::select! {
            event = cache.recv() => match event {
                Ok(CacheEvent::Inserted { chat_id, message_id }) => {
                    if let Some(m) = client.cache().get(&chat_id, &message_id) {
                        println!("<{chat_id}> {}: {}", m.sender.id, m.content);
                    }
                }
                Ok(CacheEvent::Reconciled { temp_id, message_id, .. }) => {
                    println!("  {temp_id} -> {message_id}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("connection: {}", *state.borrow_and_update());
            }
        }
    }
}

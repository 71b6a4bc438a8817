//! Line-mode client for the realtime chat service.
//!
//! Signs in over HTTP, then either follows the thread list or opens a
//! conversation with one peer. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/courier/config.toml`).
//!
//! ```bash
//! # Follow the thread list
//! cargo run --bin courier -- --username alice --password secret inbox
//!
//! # Chat with bob; each line typed is sent, `/quit` leaves
//! COURIER_USERNAME=alice COURIER_PASSWORD=secret cargo run --bin courier -- chat bob
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use courier::api::http::HttpApi;
use courier::api::{ApiError, CredentialStore};
use courier::config::{CliArgs, ClientConfig, ConfigError};
use courier::presence::label_now;
use courier::room::{RoomError, RoomEvent};
use courier::session::{Session, SessionError, SessionEvent};
use courier_proto::message::Message;
use courier_proto::thread::ThreadSummary;

#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Realtime one-to-one chat client")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations and follow live thread updates.
    Inbox,
    /// Open the conversation with a peer.
    Chat {
        /// The peer's username.
        peer: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing {0}; pass it on the command line or via the environment")]
    Missing(&'static str),
    #[error("the server rejected the session credentials")]
    AuthRejected,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.args.log_level, cli.args.log_file.as_deref());

    tracing::info!("courier starting");
    let result = run(cli).await;
    tracing::info!("courier exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(err = %e, "courier failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the conversation on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = ClientConfig::load(&cli.args)?;
    let username = config.username.as_deref().ok_or(CliError::Missing("username"))?;
    let password = config.password.as_deref().ok_or(CliError::Missing("password"))?;

    let api = Arc::new(HttpApi::new(config.api_base.clone(), CredentialStore::new())?);
    api.login(username, password).await?;

    let (mut session, events) = Session::start(Arc::clone(&api), config.session_config()).await?;
    let result = match cli.command {
        Command::Inbox => follow_inbox(&session, events).await,
        Command::Chat { peer } => {
            // The chat view only follows room events.
            drop(events);
            chat(&mut session, &peer).await
        }
    };
    session.logout();
    result
}

async fn follow_inbox(
    session: &Session<HttpApi>,
    mut events: mpsc::Receiver<SessionEvent>,
) -> Result<(), CliError> {
    let threads = session.threads();
    if threads.is_empty() {
        println!("no conversations yet");
    }
    for thread in &threads {
        println!("{}", thread_line(thread));
    }
    println!("{} unread", session.total_unread());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::ThreadUpdated(thread)) => println!("{}", thread_line(&thread)),
                Some(SessionEvent::Presence(state)) => {
                    println!("* {} is {}", state.peer, label_now(&state));
                }
                Some(SessionEvent::InboxConnection(state)) => println!("[inbox {state}]"),
                Some(SessionEvent::PresenceConnection(_)) => {}
                Some(SessionEvent::AuthRejected(channel)) => {
                    tracing::warn!(%channel, "credential rejected");
                    return Err(CliError::AuthRejected);
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn chat(session: &mut Session<HttpApi>, peer: &str) -> Result<(), CliError> {
    let mut events = session.open_room(peer).await?;
    let me = session.me().username.clone();
    let Some(room) = session.room() else {
        return Ok(());
    };

    for message in room.messages() {
        println!("{}", message_line(&message, &me));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if line.trim() == "/quit" {
                    return Ok(());
                }
                if line.trim().is_empty() {
                    continue;
                }
                room.input_changed(&line);
                if !room.send_text(&line)? {
                    println!("[not connected, message not sent]");
                }
            }
            event = events.recv() => match event {
                Some(RoomEvent::MessageAdded(message)) => println!("{}", message_line(&message, &me)),
                Some(RoomEvent::ReceiptChanged { message_id, status }) => {
                    println!("  #{message_id} {status}");
                }
                Some(RoomEvent::PeerTyping(true)) => println!("  {peer} is typing..."),
                Some(RoomEvent::PeerTyping(false)) => {}
                Some(RoomEvent::Presence(state)) => println!("[{peer} {}]", label_now(&state)),
                Some(RoomEvent::Connection(state)) => println!("[{state}]"),
                Some(RoomEvent::Reconnecting { attempt, delay }) => {
                    println!("[reconnecting in {}s, attempt {attempt}]", delay.as_secs());
                }
                Some(RoomEvent::AuthRejected) => return Err(CliError::AuthRejected),
                Some(RoomEvent::ReconnectExhausted) => {
                    println!("[connection lost]");
                    return Ok(());
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn thread_line(thread: &ThreadSummary) -> String {
    let preview = thread.last_message.as_ref().map_or(String::new(), |last| {
        let prefix = if last.from_me { "you: " } else { "" };
        format!(" {prefix}{}", last.message.text)
    });
    let unread = if thread.unread_count > 0 {
        format!(" ({})", thread.unread_count)
    } else {
        String::new()
    };
    format!("{}{unread}{preview}", thread.peer.username)
}

fn message_line(message: &Message, me: &str) -> String {
    let time = message.created_at.format("%H:%M");
    if message.is_sent_by(me) {
        format!("[{time}] you: {} ({})", message.text, message.status)
    } else {
        format!("[{time}] {}: {}", message.sender.username, message.text)
    }
}

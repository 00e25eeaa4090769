#![deny(dead_code)]
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

mod credentials;
mod utils;

use crate::credentials::{load_session, save_session, SavedSession};
use hublink::{
    AvailabilityStatus, ChatSession, ChatUpdate, ClientConfig, ConnectionState, FeedStatus, Message,
    NotificationFeed, NotificationUpdate, PresenceChannel, PresenceUpdate,
};

/// How long a one-shot command waits for the hub before giving up.
const WAIT_FOR_HUB: Duration = Duration::from_secs(20);

/// Command line arguments for hublink
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "hublink: chat, availability and notifications for the service marketplace from the terminal."
)]
struct Args {
    /// Directory for the saved session and the log file
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save backend URLs and the signed-in user for later commands
    Login {
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        hub_url: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Chat with another user; `/read` marks their messages as read, `/quit` leaves
    Chat {
        /// The other user's id
        user: String,
    },
    /// Show the signed-in provider's availability, or change it
    Status {
        #[arg(long, value_name = "STATUS")]
        set: Option<AvailabilityStatus>,
    },
    /// List notifications
    Notifications {
        /// Keep printing live notifications until interrupted
        #[arg(long)]
        follow: bool,
    },
}

/// Use the flag, then the environment, then ask
fn prompt(value: Option<String>, var: &str, question: &str) -> Result<String> {
    if let Some(value) = value.or_else(|| env::var(var).ok()) {
        return Ok(value);
    }
    eprintln!("{}", question);
    utils::read_line()?.ok_or_else(|| anyhow!("No input for {}", var))
}

fn load_config() -> Result<ClientConfig> {
    match load_session()? {
        Some(session) => Ok(session.to_config().merge_env()),
        None => ClientConfig::from_env().context("No saved session; run `hublink login` first"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.data_dir {
        credentials::set_data_dir_override(dir.clone());
    }
    let log_file_path = credentials::get_data_dir()?.join("hublink.log");
    utils::setup_logging(Some(&log_file_path), LevelFilter::Debug)?;

    info!("hublink starting up");
    info!("System information: {} {}", env::consts::OS, env::consts::ARCH);
    info!("Logging to file: {}", log_file_path.display());

    let result = match args.command {
        Command::Login { api_url, hub_url, user, token } => login(api_url, hub_url, user, token),
        Command::Chat { user } => run_chat(load_config()?, &user).await,
        Command::Status { set } => run_status(load_config()?, set).await,
        Command::Notifications { follow } => run_notifications(load_config()?, follow).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn login(api_url: Option<String>, hub_url: Option<String>, user: Option<String>, token: Option<String>) -> Result<()> {
    let api_url = prompt(api_url, "HUBLINK_API_URL", "Enter the API base URL (e.g. https://example.com):")?;
    let hub_url = match hub_url.or_else(|| env::var("HUBLINK_HUB_URL").ok()) {
        Some(url) => url,
        None => api_url.clone(),
    };
    let user = prompt(user, "HUBLINK_USER_ID", "Enter your user id:")?;
    let token = match token.or_else(|| env::var("HUBLINK_TOKEN").ok()) {
        Some(token) => Some(token),
        None => {
            eprintln!("Enter your access token (leave empty for none):");
            utils::read_line()?
        }
    };

    let session = SavedSession::new(&api_url, &hub_url, &user, token.as_deref());
    // Validate the URLs before saving
    session.to_config().hub_url(hublink::config::CHAT_HUB)?;
    save_session(&session)?;
    println!("Saved session for user {}", user);
    Ok(())
}

fn print_message(self_id: &str, message: &Message) {
    let who = if message.sender_id == self_id { "me" } else { message.sender_id.as_str() };
    let unread = if message.is_read || message.sender_id == self_id { "" } else { " *" };
    println!("[{}] {}: {}{}", message.sent_at.format("%Y-%m-%d %H:%M"), who, message.content, unread);
}

async fn run_chat(config: ClientConfig, other_id: &str) -> Result<()> {
    let self_id = config.user_id().ok_or_else(|| anyhow!("No user configured"))?.to_string();
    let (session, mut updates) = ChatSession::connect(&config)?;

    println!("Connecting to chat... please wait...");
    // Printed by the HistoryReplaced update below
    if let Err(e) = session.load_history(&self_id, other_id).await {
        eprintln!("Could not load history: {}", e);
    }

    // Stdin is blocking, so read it on its own thread
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || loop {
        match utils::read_line() {
            Ok(Some(line)) => {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(ChatUpdate::MessageAppended(message)) => print_message(&self_id, &message),
                Some(ChatUpdate::HistoryReplaced(_)) => {
                    for message in session.messages().await {
                        print_message(&self_id, &message);
                    }
                }
                Some(ChatUpdate::MarkedAsRead { sender_id, updated }) => {
                    debug!("{} messages from {} marked as read", updated, sender_id);
                }
                Some(ChatUpdate::Connection(state)) => match state {
                    ConnectionState::Connected => println!("-- connected"),
                    ConnectionState::Reconnecting => println!("-- connection lost, reconnecting"),
                    ConnectionState::Disconnected => println!("-- disconnected"),
                    ConnectionState::Connecting => {}
                },
                Some(ChatUpdate::Error(Some(e))) => eprintln!("-- {}", e),
                Some(ChatUpdate::Error(None)) => {}
                None => break,
            },
            line = lines.recv() => match line.as_deref() {
                None | Some("/quit") => break,
                Some("/read") => {
                    if let Err(e) = session.mark_as_read(other_id).await {
                        eprintln!("Could not mark as read: {}", e);
                    }
                }
                Some(content) => {
                    if !session.can_send() {
                        eprintln!("Not connected; message not sent");
                        continue;
                    }
                    if let Err(e) = session.send(other_id, content).await {
                        eprintln!("Could not send: {}", e);
                    }
                }
            },
        }
    }

    session.close();
    Ok(())
}

async fn run_status(config: ClientConfig, set: Option<AvailabilityStatus>) -> Result<()> {
    let (channel, mut updates) = PresenceChannel::connect(&config)?;

    let outcome = timeout(WAIT_FOR_HUB, async {
        let mut requested = false;
        while let Some(update) = updates.recv().await {
            match update {
                PresenceUpdate::Connection(ConnectionState::Connected) => {
                    if let Some(status) = set {
                        channel.update_status(status).await?;
                        requested = true;
                    }
                }
                PresenceUpdate::Connection(ConnectionState::Disconnected) => {
                    return Err(anyhow!("Status hub unavailable"));
                }
                // Wait for the broadcast when a change was requested
                PresenceUpdate::Status(status) if set.is_none() || (requested && Some(status) == set) => {
                    return Ok(status);
                }
                _ => {}
            }
        }
        Err(anyhow!("Status hub closed"))
    })
    .await;

    channel.close();
    match outcome {
        Ok(Ok(status)) => {
            println!("{}", status);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("Timed out waiting for status updates")),
    }
}

async fn run_notifications(config: ClientConfig, follow: bool) -> Result<()> {
    let (feed, mut updates) = NotificationFeed::connect(&config)?;

    // The backlog and the hub connect independently; wait for the backlog only
    let merged = timeout(WAIT_FOR_HUB, async {
        while let Some(update) = updates.recv().await {
            if let NotificationUpdate::BacklogMerged(count) = update {
                return Some(count);
            }
        }
        None
    })
    .await;
    if !matches!(merged, Ok(Some(_))) {
        warn!("Stored notifications not loaded");
        eprintln!("Stored notifications unavailable");
    }

    for notification in feed.notifications().await {
        let marker = if notification.is_unread() { "*" } else { " " };
        println!("{} [{}] {} ({})", marker, notification.date.format("%Y-%m-%d %H:%M"), notification.message, notification.icon);
    }
    println!("{} unread", feed.unread_count().await);

    if follow {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(NotificationUpdate::Received(notification)) => {
                        println!("* [{}] {}", notification.date.format("%H:%M"), notification.message);
                    }
                    Some(NotificationUpdate::Status(FeedStatus::Connected)) => println!("-- live"),
                    Some(NotificationUpdate::Status(FeedStatus::Connecting)) => println!("-- connecting"),
                    Some(NotificationUpdate::Status(FeedStatus::Disconnected)) => println!("-- offline, retrying"),
                    Some(NotificationUpdate::BacklogMerged(_)) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    feed.close();
    Ok(())
}

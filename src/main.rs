//! Job search client CLI
//!
//! Sign in, inspect conversations and chat with a recruiter or candidate from
//! the terminal.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use jobsearch_client::api::ApiClient;
use jobsearch_client::chat::{ChatCommand, ChatSession, ChatSnapshot};
use jobsearch_client::config::Config;
use jobsearch_client::context::AppContext;
use jobsearch_client::hub::{ConnectionStatus, HubClient};
use jobsearch_client::message::{FileAttachment, Message};
use jobsearch_client::storage::Credentials;
use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Job search client
#[derive(Parser)]
#[command(name = "jobsearch")]
#[command(about = "Terminal client for the job search backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the token locally
    Login {
        /// Account email
        email: String,

        /// Account password
        #[arg(short, long)]
        password: String,
    },

    /// Forget the stored token
    Logout,

    /// Show the signed-in user and profile completion
    Whoami,

    /// Print the conversation with a user
    History {
        /// Peer user id
        peer: String,
    },

    /// Open a live chat with a user
    Chat {
        /// Peer user id
        peer: String,

        /// Show own messages sent from other devices during polling
        #[arg(long)]
        adopt_own: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = AppContext::open(Config::from_env()).context("opening local storage")?;

    match cli.command {
        Commands::Login { email, password } => cmd_login(&mut ctx, &email, &password).await,
        Commands::Logout => cmd_logout(&mut ctx),
        Commands::Whoami => cmd_whoami(&mut ctx).await,
        Commands::History { peer } => cmd_history(&ctx, &peer).await,
        Commands::Chat { peer, adopt_own } => {
            if adopt_own {
                ctx.config.adopt_own_from_poll = true;
            }
            cmd_chat(&ctx, &peer).await
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn require_login(ctx: &AppContext) -> anyhow::Result<Credentials> {
    match ctx.credentials() {
        Some(creds) => Ok(creds),
        None => bail!("not logged in, run `jobsearch login <email> --password <password>`"),
    }
}

async fn cmd_login(ctx: &mut AppContext, email: &str, password: &str) -> anyhow::Result<()> {
    let mut api = ApiClient::new(&ctx.config, None);
    let creds = api.login(email, password).await.context("login failed")?;
    creds.save(&mut ctx.store)?;
    info!(user_id = %creds.user_id, "logged in");
    println!("Logged in as user {}", creds.user_id);
    Ok(())
}

fn cmd_logout(ctx: &mut AppContext) -> anyhow::Result<()> {
    ctx.logout()?;
    println!("Logged out");
    Ok(())
}

async fn cmd_whoami(ctx: &mut AppContext) -> anyhow::Result<()> {
    let creds = require_login(ctx)?;
    let name = creds
        .user
        .as_ref()
        .and_then(|u| u.full_name.clone())
        .unwrap_or_else(|| "(no name)".to_string());
    println!("User {} - {}", creds.user_id, name);
    if let Some(role) = &creds.role {
        println!("Role: {}", role);
    }

    let api = ApiClient::new(&ctx.config, Some(creds));
    ctx.profile = api.profile_completion().await;
    println!("Profile {}% complete", ctx.profile.percent());
    let missing: Vec<_> = ctx.profile.missing().iter().map(|s| s.resource()).collect();
    if !missing.is_empty() {
        println!("Missing: {}", missing.join(", "));
    }
    Ok(())
}

async fn cmd_history(ctx: &AppContext, peer: &str) -> anyhow::Result<()> {
    let creds = require_login(ctx)?;
    let api = ApiClient::new(&ctx.config, Some(creds));

    let Some(messages) = api.fetch_history(peer).await else {
        println!("No messages");
        return Ok(());
    };
    let messages = jobsearch_client::reconciler::replace(messages);
    if messages.is_empty() {
        println!("No messages");
    }
    for msg in &messages {
        println!("{}", format_line(msg, peer));
    }
    Ok(())
}

async fn cmd_chat(ctx: &AppContext, peer: &str) -> anyhow::Result<()> {
    let creds = require_login(ctx)?;
    let me = creds.user_id.clone();

    let hub = match HubClient::spawn(&ctx.config, &creds) {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!(error = %e, "chat hub unavailable, falling back to polling");
            None
        }
    };

    let api = ApiClient::new(&ctx.config, Some(creds));
    let session = ChatSession::new(api, &ctx.config, &me, peer);

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (update_tx, update_rx) = watch::channel(ChatSnapshot::default());
    let session_task = tokio::spawn(session.run(cmd_rx, hub, update_tx));
    let render_task = tokio::spawn(render(update_rx, peer.to_string()));

    println!(
        "Chatting with {} (/attach <url> [caption] to share a file, /cancel to reset a stuck send, /quit to leave)",
        peer
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match line.trim() {
            "/quit" => ChatCommand::Quit,
            "/cancel" => ChatCommand::Cancel,
            "" => continue,
            text => match text.strip_prefix("/attach ") {
                Some(rest) => attach_command(rest),
                None => ChatCommand::Send(text.to_string()),
            },
        };
        let quit = command == ChatCommand::Quit;
        if cmd_tx.send(command).await.is_err() || quit {
            break;
        }
    }
    drop(cmd_tx);

    let view = session_task.await.context("chat session panicked")?;
    render_task.abort();
    info!(messages = view.messages().len(), "left chat");
    Ok(())
}

/// `/attach <url> [caption]` for a file that is already uploaded
fn attach_command(rest: &str) -> ChatCommand {
    let (url, caption) = match rest.trim().split_once(char::is_whitespace) {
        Some((url, caption)) => (url, caption.trim()),
        None => (rest.trim(), ""),
    };
    let name = url.rsplit('/').next().unwrap_or(url).to_string();
    ChatCommand::SendFile {
        file: FileAttachment {
            name,
            size: 0,
            mime_type: "application/octet-stream".to_string(),
            url: url.to_string(),
        },
        caption: caption.to_string(),
    }
}

// ============================================================================
// Rendering
// ============================================================================

async fn render(mut updates: watch::Receiver<ChatSnapshot>, peer: String) {
    let mut printed: HashSet<String> = HashSet::new();
    let mut last_connection = ConnectionStatus::Disconnected;
    let mut last_online = false;
    let mut last_sending = false;
    let mut last_error: Option<String> = None;

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();

        if snapshot.connection != last_connection {
            println!("[hub {}]", snapshot.connection);
            last_connection = snapshot.connection;
        }
        if snapshot.peer_online != last_online {
            println!("[{} is {}]", peer, if snapshot.peer_online { "online" } else { "offline" });
            last_online = snapshot.peer_online;
        }

        if snapshot.sending != last_sending {
            if snapshot.sending {
                println!("[sending...]");
            }
            last_sending = snapshot.sending;
        }

        // placeholders are announced above, only settled messages are printed
        for msg in snapshot.messages.iter().filter(|m| !m.is_temporary()) {
            if printed.insert(msg.id.clone()) {
                println!("{}", format_line(msg, &peer));
            }
        }

        if snapshot.last_error != last_error {
            if let Some(error) = &snapshot.last_error {
                println!("! {} (draft kept: {:?})", error, snapshot.draft);
            }
            last_error = snapshot.last_error.clone();
        }
    }
}

fn format_line(msg: &Message, peer: &str) -> String {
    let who = if msg.is_mine() { "you" } else { peer };
    let mut line = format!("{} {}: {}", msg.display_time(), who, msg.text);
    if let Some(file) = &msg.file {
        line.push_str(&format!(" [file {} {}B]", file.name, file.size));
    }
    line
}

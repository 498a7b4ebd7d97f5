//! Review Chat CLI
//!
//! Terminal client for the review-chat backend. Replies stream to stdout as
//! they arrive; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # List conversations
//! review-chat chats
//!
//! # Ask about a pull request in a new conversation
//! review-chat send --new "https://github.com/o/r/pull/42"
//!
//! # Continue a conversation without streaming
//! review-chat send --buffered --chat <CHAT_ID> "What about the tests?"
//!
//! # Point at another backend, with verbose logging
//! REVIEW_CHAT_API_URL=https://review.example.com RUST_LOG=debug review-chat health
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C) while a reply streams: cancel it, keeping your message

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{debug, info};

use review_chat_core::messages::PrDisplayState;
use review_chat_core::{
    default_config_path, load_config_from_path, ChatId, ChatUpdate, ClientConfig,
    ConfigOverrides, Dispatcher, HttpChatClient, InputAffordance, Message, MessageRole,
    ReviewAction, StreamMode,
};

/// Review Chat - talk to a code review assistant about PRs and commits
#[derive(Parser, Debug)]
#[command(name = "review-chat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "REVIEW_CHAT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config and REVIEW_CHAT_API_URL)
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Fail a stream after this many milliseconds without data (0 disables)
    #[arg(long, value_name = "MS")]
    idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "REVIEW_CHAT_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations
    Chats,
    /// Create a conversation
    New {
        /// Title (defaults to "New Chat")
        #[arg(long)]
        title: Option<String>,
    },
    /// Rename a conversation
    Rename {
        /// Conversation ID
        chat: String,
        /// New title
        title: String,
    },
    /// Delete a conversation
    Delete {
        /// Conversation ID
        chat: String,
    },
    /// Print a conversation's messages
    History {
        /// Conversation ID
        chat: String,
    },
    /// Send a message and print the reply
    Send {
        /// Conversation ID
        #[arg(long, required_unless_present = "new", conflicts_with = "new")]
        chat: Option<String>,
        /// Message text
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        message: Vec<String>,
        /// Start a new conversation
        #[arg(long)]
        new: bool,
        /// Wait for the complete reply instead of streaming
        #[arg(long)]
        buffered: bool,
    },
    /// Analyze a pull request directly
    AnalyzePr {
        /// Pull request URL
        url: String,
        /// Analysis type
        #[arg(long = "type", default_value = "general")]
        analysis_type: String,
    },
    /// Analyze a commit directly
    AnalyzeCommit {
        /// Commit URL
        url: String,
    },
    /// Submit a review on a pull request
    Review {
        /// Pull request URL
        url: String,
        /// Review action
        #[arg(long, value_enum)]
        action: ReviewArg,
        /// Review body
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Check backend health
    Health,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReviewArg {
    Approve,
    RequestChanges,
    Comment,
}

impl From<ReviewArg> for ReviewAction {
    fn from(arg: ReviewArg) -> Self {
        match arg {
            ReviewArg::Approve => Self::Approve,
            ReviewArg::RequestChanges => Self::RequestChanges,
            ReviewArg::Comment => Self::Comment,
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "review_chat={level},review_chat_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.api_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(ms) = args.idle_timeout_ms {
        overrides = overrides.with_idle_timeout_ms(ms);
    }
    overrides.apply(&mut config).context("Invalid command-line option")?;

    info!(
        base_url = %config.base_url,
        source = %config.source(),
        "Configuration loaded"
    );
    Ok(config)
}

fn print_message(message: &Message) {
    let role = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    };
    println!("[{role}] {}", message.content);
    print_metadata(message);
}

fn print_metadata(message: &Message) {
    if let Some(ref pr) = message.pr_metadata {
        let state = match pr.display_state() {
            PrDisplayState::Open => "open",
            PrDisplayState::Closed => "closed",
            PrDisplayState::Merged => "merged",
        };
        println!(
            "  PR: {} ({state}, +{} -{})",
            pr.pr_title.as_deref().unwrap_or("untitled"),
            pr.additions.unwrap_or(0),
            pr.deletions.unwrap_or(0),
        );
    }
    if let Some(ref commit) = message.commit_metadata {
        println!(
            "  Commit: {} {}",
            commit.short_sha().unwrap_or("unknown"),
            commit.summary().unwrap_or_default(),
        );
    }
}

async fn send(
    client: HttpChatClient,
    config: &ClientConfig,
    chat: Option<String>,
    new: bool,
    text: &str,
    mode: StreamMode,
) -> Result<()> {
    let mut dispatcher = Dispatcher::new(client, config);

    let chat_id = if new {
        let record = dispatcher.backend().create_chat(None).await?;
        let id = record.id.clone();
        dispatcher.store_mut().insert_conversation(record);
        println!("chat {id}");
        id
    } else {
        let id = ChatId::from(chat.context("Missing conversation ID")?.as_str());
        let records = dispatcher.backend().list_chats().await?;
        dispatcher.store_mut().load_conversations(records);
        let history = dispatcher.backend().get_messages(&id).await?;
        dispatcher
            .store_mut()
            .replace_messages(&id, history)
            .with_context(|| format!("Unknown conversation {id}"))?;
        id
    };

    let info = dispatcher.send(&chat_id, text, mode)?;
    let affordance = InputAffordance {
        detected: info.url_kind,
        has_chat: true,
        loading: true,
    };
    eprintln!("{}", affordance.status());

    let mut streamed = String::new();
    let mut stdout = std::io::stdout();
    loop {
        let update = tokio::select! {
            update = dispatcher.next_update(&chat_id) => update,
            _ = signal::ctrl_c() => {
                dispatcher.cancel(&chat_id)?;
                println!();
                eprintln!("Cancelled");
                return Ok(());
            }
        };
        let Some(update) = update else {
            break;
        };

        match update {
            ChatUpdate::Streaming { content, .. } => {
                if let Some(suffix) = content.strip_prefix(streamed.as_str()) {
                    write!(stdout, "{suffix}")?;
                    stdout.flush()?;
                }
                streamed = content;
            }
            ChatUpdate::Completed { message, .. } => {
                // Buffered replies, and completions that replace the text,
                // arrive in full here
                match message.content.strip_prefix(streamed.as_str()) {
                    Some(rest) => println!("{rest}"),
                    None => println!("\n{}", message.content),
                }
                print_metadata(&message);
                debug!(message_id = %message.id, "Reply persisted");
            }
            ChatUpdate::Renamed { title, .. } => eprintln!("Renamed to \"{title}\""),
            ChatUpdate::Failed { reason, .. } => {
                println!();
                bail!("{reason}");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_config(&args)?;
    let client = HttpChatClient::new(&config)?;

    match args.command {
        Command::Chats => {
            for chat in client.list_chats().await? {
                println!(
                    "{}\t{}\t{}",
                    chat.id,
                    chat.updated_at.format("%Y-%m-%d %H:%M"),
                    chat.title
                );
            }
        }
        Command::New { title } => {
            let chat = client.create_chat(title.as_deref()).await?;
            println!("{}\t{}", chat.id, chat.title);
        }
        Command::Rename { chat, title } => {
            let title = title.trim();
            if title.is_empty() {
                bail!("Title cannot be empty");
            }
            let chat = client
                .update_chat_title(&ChatId::from(chat.as_str()), title)
                .await?;
            println!("{}\t{}", chat.id, chat.title);
        }
        Command::Delete { chat } => {
            client.delete_chat(&ChatId::from(chat.as_str())).await?;
        }
        Command::History { chat } => {
            for message in client.get_messages(&ChatId::from(chat.as_str())).await? {
                print_message(&message);
            }
        }
        Command::Send {
            chat,
            message,
            new,
            buffered,
        } => {
            let mode = if buffered {
                StreamMode::Buffered
            } else {
                config.default_mode
            };
            send(client, &config, chat, new, &message.join(" "), mode).await?;
        }
        Command::AnalyzePr { url, analysis_type } => {
            let result = client.analyze_pr(&url, &analysis_type).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::AnalyzeCommit { url } => {
            let result = client.analyze_commit(&url).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Review { url, action, body } => {
            let result = client.submit_review(&url, action.into(), &body).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Health => {
            let health = client.health().await?;
            println!("status: {}", health.status);
            if !health.github.is_null() {
                println!("github: {}", health.github);
            }
        }
    }

    Ok(())
}

//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, builds the stores and
//! configuration a command needs, and dispatches to the command handlers.

pub mod bots;
pub mod chat;
pub mod mcp;
pub mod sessions;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};

use crate::core::bot::Bot;
use crate::core::config::{Config, McpServerConfig};
use crate::core::session::SessionFilter;
use crate::core::store::{BotStore, FileStore};

#[derive(Parser)]
#[command(name = "confab", version)]
#[command(about = "Chat with LLM providers and let them call tools on MCP servers")]
#[command(
    long_about = "Confab streams conversations with OpenAI-compatible chat providers and \
routes the model's tool calls to Model Context Protocol (MCP) servers. Sessions and bots \
are stored on disk and can be resumed, exported and imported.\n\n\
Authentication:\n\
  API keys are read from <PROVIDER>_API_KEY (or the provider's api_key_env), then from the\n\
  system keyring (service 'confab', user = provider id).\n\n\
Logging:\n\
  CONFAB_LOG / RUST_LOG    tracing filter directives (default: warn)\n\
  --log-file <PATH>        write logs to a file instead of stderr\n\n\
Interactive chat:\n\
  Enter             Send the message\n\
  Ctrl+C            Cancel the running turn\n\
  /exit, Ctrl+D     Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file to use instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write diagnostic logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat in a new or existing session (default)
    Chat(ChatArgs),
    /// List stored sessions, most recently updated first
    List {
        /// Only sessions created with this bot
        #[arg(long, value_name = "ID")]
        bot: Option<String>,
        /// Only sessions with a message containing this text
        #[arg(long, value_name = "TEXT")]
        keyword: Option<String>,
        /// Show at most this many sessions
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Print a session's messages
    Show { id: String },
    /// Write a session as JSON
    Export {
        id: String,
        /// Output file (stdout when omitted)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Import a session previously written by `export`
    Import { file: PathBuf },
    /// Delete a session
    Delete { id: String },
    /// Manage bots
    Bot {
        #[command(subcommand)]
        command: BotCommands,
    },
    /// Inspect MCP servers
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
}

#[derive(clap::Args, Default, Debug, Clone, PartialEq)]
pub struct ChatArgs {
    /// Continue this session instead of starting a new one
    #[arg(long, value_name = "ID")]
    pub session: Option<String>,

    /// Bot to chat with
    #[arg(long, value_name = "ID")]
    pub bot: Option<String>,

    /// Model to use, overriding the bot and provider defaults
    #[arg(short = 'm', long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Provider to use, overriding the bot and config defaults
    #[arg(short = 'p', long, value_name = "PROVIDER")]
    pub provider: Option<String>,

    /// Send this message and exit; starts an interactive chat when omitted
    #[arg(trailing_var_arg = true)]
    pub message: Vec<String>,
}

#[derive(Subcommand)]
pub enum BotCommands {
    /// List bots
    List,
    /// Show the latest version of a bot
    Show { id: String },
    /// Create a bot, or save a new version of an existing one
    Add(BotAddArgs),
    /// Remove a bot and all of its versions
    Remove { id: String },
}

#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct BotAddArgs {
    pub id: String,

    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    #[arg(short = 'p', long, value_name = "PROVIDER")]
    pub provider: Option<String>,

    #[arg(short = 'm', long, value_name = "MODEL")]
    pub model: Option<String>,

    #[arg(long, value_name = "TEXT", conflicts_with = "system_prompt_file")]
    pub system_prompt: Option<String>,

    /// Read the system prompt from a file
    #[arg(long, value_name = "FILE")]
    pub system_prompt_file: Option<PathBuf>,

    /// MCP server to attach (repeatable)
    #[arg(long = "mcp", value_name = "SERVER")]
    pub mcp_servers: Vec<String>,

    #[arg(long, value_name = "N")]
    pub max_tool_rounds: Option<u32>,

    /// Provider request field as KEY=VALUE; VALUE is parsed as JSON when it can be
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = bots::parse_param)]
    pub params: Vec<(String, serde_json::Value)>,
}

#[derive(Subcommand)]
pub enum McpCommands {
    /// Connect to the configured servers and list their tools and resources
    List {
        /// Only the servers attached to this bot
        #[arg(long, value_name = "ID")]
        bot: Option<String>,
    },
}

/// Configuration and storage shared by every command.
pub struct CliContext {
    pub config: Config,
    pub store: Arc<FileStore>,
}

impl CliContext {
    pub fn load(config_path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let config = match config_path {
            Some(path) => Config::load_from_path(path)?,
            None => Config::load()?,
        };
        let store = FileStore::open(config.resolve_data_dir()?)?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    /// The explicit bot id, or the configured default bot.
    pub async fn load_bot(&self, id: Option<&str>) -> Result<Option<Bot>, Box<dyn Error>> {
        match id.or(self.config.default_bot.as_deref()) {
            Some(id) => Ok(Some(self.store.load_bot(id).await?)),
            None => Ok(None),
        }
    }
}

/// MCP servers to connect for a turn: the bot's own list when it has one,
/// otherwise every configured server.
pub fn servers_for_bot(config: &Config, bot: Option<&Bot>) -> Vec<McpServerConfig> {
    match bot.filter(|bot| !bot.mcp_servers.is_empty()) {
        Some(bot) => {
            let (found, missing) = config.mcp_servers_for(&bot.mcp_servers);
            for id in missing {
                eprintln!("⚠️  Bot '{}' refers to unknown MCP server '{id}'", bot.id);
            }
            found.into_iter().cloned().collect()
        }
        None => config.mcp_servers.clone(),
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    crate::logging::init_tracing(args.log_file.as_deref(), args.verbose)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let context = CliContext::load(args.config.as_deref())?;
    let command = args
        .command
        .unwrap_or_else(|| Commands::Chat(ChatArgs::default()));

    let mut stdout = std::io::stdout();
    match command {
        Commands::Chat(chat_args) => chat::run_chat(&context, chat_args).await,
        Commands::List {
            bot,
            keyword,
            limit,
        } => {
            let filter = SessionFilter {
                bot_id: bot,
                keyword,
                limit,
            };
            sessions::list_sessions(context.store.as_ref(), &filter, &mut stdout).await
        }
        Commands::Show { id } => {
            sessions::show_session(context.store.as_ref(), &id, &mut stdout).await
        }
        Commands::Export { id, output } => {
            sessions::export_session(context.store.as_ref(), &id, output.as_deref(), &mut stdout)
                .await
        }
        Commands::Import { file } => {
            sessions::import_session(context.store.as_ref(), &file, &mut stdout).await
        }
        Commands::Delete { id } => {
            sessions::delete_session(context.store.as_ref(), &id, &mut stdout).await
        }
        Commands::Bot { command } => bots::run(context.store.as_ref(), command, &mut stdout).await,
        Commands::Mcp {
            command: McpCommands::List { bot },
        } => mcp::list_servers(&context, bot.as_deref(), &mut stdout).await,
    }
}

//! `bot` subcommands.

use std::error::Error;
use std::fs;
use std::io::Write;

use serde_json::Value;

use crate::cli::{BotAddArgs, BotCommands};
use crate::core::bot::Bot;
use crate::core::store::{BotStore, StoreError};

pub async fn run<W: Write>(
    store: &dyn BotStore,
    command: BotCommands,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    match command {
        BotCommands::List => list_bots(store, out).await,
        BotCommands::Show { id } => {
            let bot = store.load_bot(&id).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&bot)?)?;
            Ok(())
        }
        BotCommands::Add(args) => add_bot(store, args, out).await,
        BotCommands::Remove { id } => {
            store.remove_bot(&id).await?;
            writeln!(out, "✅ Removed bot {id}")?;
            Ok(())
        }
    }
}

async fn list_bots<W: Write>(store: &dyn BotStore, out: &mut W) -> Result<(), Box<dyn Error>> {
    let bots = store.list_bots().await?;
    if bots.is_empty() {
        writeln!(out, "No bots defined. Create one with `confab bot add <id>`.")?;
        return Ok(());
    }
    for bot in bots {
        let model = match (&bot.provider, &bot.model) {
            (Some(provider), Some(model)) => format!("{provider}/{model}"),
            (Some(provider), None) => provider.clone(),
            (None, Some(model)) => model.clone(),
            (None, None) => "default model".to_string(),
        };
        let servers = if bot.mcp_servers.is_empty() {
            "all MCP servers".to_string()
        } else {
            bot.mcp_servers.join(", ")
        };
        writeln!(
            out,
            "{} (v{})  {}  {}  [{}]",
            bot.id,
            bot.version,
            bot.label(),
            model,
            servers
        )?;
    }
    Ok(())
}

async fn add_bot<W: Write>(
    store: &dyn BotStore,
    args: BotAddArgs,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let base = match store.load_bot(&args.id).await {
        Ok(existing) => existing,
        Err(StoreError::NotFound { .. }) => Bot::new(args.id.clone()),
        Err(err) => return Err(err.into()),
    };
    let system_prompt = match &args.system_prompt_file {
        Some(path) => Some(fs::read_to_string(path)?),
        None => args.system_prompt.clone(),
    };
    let saved = store
        .save_bot(apply_bot_args(base, args, system_prompt))
        .await?;
    writeln!(out, "✅ Saved bot {} (version {})", saved.id, saved.version)?;
    Ok(())
}

/// Overlays the given flags on `base`; flags that were not given keep the
/// existing values.
pub fn apply_bot_args(mut base: Bot, args: BotAddArgs, system_prompt: Option<String>) -> Bot {
    if let Some(name) = args.name {
        base.display_name = name;
    }
    if args.provider.is_some() {
        base.provider = args.provider;
    }
    if args.model.is_some() {
        base.model = args.model;
    }
    if system_prompt.is_some() {
        base.system_prompt = system_prompt;
    }
    if !args.mcp_servers.is_empty() {
        base.mcp_servers = args.mcp_servers;
    }
    if args.max_tool_rounds.is_some() {
        base.max_tool_rounds = args.max_tool_rounds;
    }
    for (key, value) in args.params {
        base.params.insert(key, value);
    }
    base
}

/// Parses `KEY=VALUE`. The value is read as JSON when possible, so
/// `temperature=0.2` stores a number and `stop=END` a string.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

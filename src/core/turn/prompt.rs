use crate::core::bot::Bot;
use chrono::{DateTime, Local};

/// System prompt for one provider call: the current time, the bot's own
/// prompt, then the MCP section describing available tools and resources.
pub fn build_system_prompt(
    bot: Option<&Bot>,
    mcp_section: Option<&str>,
    now: DateTime<Local>,
) -> String {
    let mut sections = vec![format!(
        "The current time is {}.",
        now.format("%Y-%m-%d %H:%M:%S %:z (%A)")
    )];

    if let Some(prompt) = bot
        .and_then(|bot| bot.system_prompt.as_deref())
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
    {
        sections.push(prompt.to_string());
    }

    if let Some(mcp) = mcp_section.filter(|section| !section.trim().is_empty()) {
        sections.push(format!(
            "# MCP Servers\n\nTools are called by their qualified `server.tool` names.\n\n{mcp}"
        ));
    }

    sections.join("\n\n")
}

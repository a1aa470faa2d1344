//! Session listing, display, export, import and deletion.

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::core::config::path_display;
use crate::core::message::{Message, Role};
use crate::core::session::{Session, SessionFilter};
use crate::core::store::SessionStore;

pub async fn list_sessions<W: Write>(
    store: &dyn SessionStore,
    filter: &SessionFilter,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let sessions = store.list_sessions(filter).await?;
    if sessions.is_empty() {
        writeln!(out, "No sessions found.")?;
        return Ok(());
    }

    for summary in sessions {
        let bot = summary.bot_id.as_deref().unwrap_or("-");
        writeln!(
            out,
            "{}  {}  bot={}  messages={}  {}",
            summary.id,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            bot,
            summary.message_count,
            summary.preview
        )?;
    }
    Ok(())
}

pub async fn show_session<W: Write>(
    store: &dyn SessionStore,
    id: &str,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let session = store.load(id).await?;
    writeln!(out, "Session {}", session.id)?;
    if let Some(bot) = &session.bot_id {
        writeln!(out, "Bot: {bot}")?;
    }
    writeln!(
        out,
        "Created: {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    for message in &session.messages {
        writeln!(out)?;
        write_message(out, message)?;
    }
    Ok(())
}

fn write_message<W: Write>(out: &mut W, message: &Message) -> std::io::Result<()> {
    match message.role {
        Role::User => writeln!(out, "You: {}", message.text),
        Role::Assistant => {
            let model = message.model.as_deref().unwrap_or("assistant");
            if !message.text.is_empty() {
                writeln!(out, "{model}: {}", message.text)?;
            }
            for call in &message.tool_calls {
                writeln!(out, "  → {} [{}] {}", call.name, call.id, call.arguments)?;
            }
            Ok(())
        }
        Role::Tool => match &message.tool_result {
            Some(result) => writeln!(
                out,
                "  ← [{}] {}",
                result.call_id,
                result.model_content()
            ),
            None => Ok(()),
        },
    }
}

pub async fn export_session<W: Write>(
    store: &dyn SessionStore,
    id: &str,
    output: Option<&Path>,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let session = store.load(id).await?;
    let json = serde_json::to_string_pretty(&session)?;
    match output {
        Some(path) => {
            fs::write(path, json)?;
            writeln!(
                out,
                "✅ Exported session {} ({} messages) to {}",
                session.id,
                session.messages.len(),
                path_display(path)
            )?;
        }
        None => writeln!(out, "{json}")?,
    }
    Ok(())
}

pub async fn import_session<W: Write>(
    store: &dyn SessionStore,
    file: &Path,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    let contents = fs::read_to_string(file)?;
    let session: Session = serde_json::from_str(&contents)
        .map_err(|err| format!("{} is not an exported session: {err}", path_display(file)))?;
    let imported = store.import(session).await?;
    writeln!(
        out,
        "✅ Imported session {} ({} messages)",
        imported.id,
        imported.messages.len()
    )?;
    Ok(())
}

pub async fn delete_session<W: Write>(
    store: &dyn SessionStore,
    id: &str,
    out: &mut W,
) -> Result<(), Box<dyn Error>> {
    store.delete(id).await?;
    writeln!(out, "✅ Deleted session {id}")?;
    Ok(())
}

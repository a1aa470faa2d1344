//! Persistence for sessions and bots.
//!
//! Two implementations share the [`SessionStore`] and [`BotStore`] traits:
//! [`MemoryStore`] keeps everything in process and backs the tests, and
//! [`FileStore`] writes under a data directory:
//!
//! ```text
//! data_dir/
//! ├── sessions/
//! │   └── <id>.jsonl     header record, then one message record per line
//! └── bots/
//!     └── <id>.json      every saved version of the bot
//! ```

pub mod file;
pub mod memory;

use crate::core::bot::Bot;
use crate::core::message::{Message, NewMessage};
use crate::core::session::{Session, SessionFilter, SessionSummary};
use async_trait::async_trait;
use std::path::PathBuf;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("corrupt record in {}: {detail}", .path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn session_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }

    pub(crate) fn bot_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "bot",
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates an empty session with a fresh id.
    async fn create(&self, bot_id: Option<&str>) -> Result<Session, StoreError>;

    async fn load(&self, id: &str) -> Result<Session, StoreError>;

    /// Assigns `seq` and timestamp, validates tool-result references and
    /// commits the message. Either the message is durable or nothing is.
    async fn append(&self, id: &str, message: NewMessage) -> Result<Message, StoreError>;

    /// Most recently updated first.
    async fn list_sessions(&self, filter: &SessionFilter)
        -> Result<Vec<SessionSummary>, StoreError>;

    /// Stores an exported session verbatim. Existing ids are rejected.
    async fn import(&self, session: Session) -> Result<Session, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BotStore: Send + Sync {
    /// Latest saved version.
    async fn load_bot(&self, id: &str) -> Result<Bot, StoreError>;

    /// Saves `bot` as a new version and returns it with the version set.
    async fn save_bot(&self, bot: Bot) -> Result<Bot, StoreError>;

    /// Latest version of every bot, sorted by id.
    async fn list_bots(&self) -> Result<Vec<Bot>, StoreError>;

    async fn remove_bot(&self, id: &str) -> Result<(), StoreError>;
}

/// Session ids end up in file names.
pub(crate) fn check_session_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::session_not_found(id))
    }
}

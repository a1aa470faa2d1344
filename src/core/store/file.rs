use super::{check_session_id, BotStore, SessionStore, StoreError};
use crate::core::bot::{validate_bot_id, Bot};
use crate::core::message::{Message, NewMessage};
use crate::core::session::{finish_listing, Session, SessionFilter, SessionSummary};
use crate::utils::ids::new_session_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const SESSIONS_DIR: &str = "sessions";
const BOTS_DIR: &str = "bots";

#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bot_id: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Header(SessionHeader),
    Message(Message),
}

/// A session read back from disk plus the byte length of its intact
/// prefix. Anything past `valid_len` is a torn write.
struct LoadedSession {
    session: Session,
    valid_len: u64,
    file_len: u64,
}

struct Inner {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// JSONL-backed store rooted at a data directory.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

impl FileStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = data_dir.into();
        fs::create_dir_all(root.join(SESSIONS_DIR))?;
        fs::create_dir_all(root.join(BOTS_DIR))?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|err| StoreError::Io(io::Error::other(err)))?
    }
}

fn record_line(record: &Record) -> Result<Vec<u8>, StoreError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file_mut().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn parse_session_file(path: &Path, bytes: &[u8]) -> Result<LoadedSession, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    let mut header: Option<SessionHeader> = None;
    let mut messages = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let Some(end) = memchr::memchr(b'\n', rest) else {
            warn!(
                path = %path.display(),
                bytes = rest.len(),
                "Ignoring unterminated trailing record"
            );
            break;
        };
        line_no += 1;
        let line = rest[..end].trim_ascii();
        offset += end + 1;
        if line.is_empty() {
            continue;
        }

        let record: Record = serde_json::from_slice(line)
            .map_err(|err| corrupt(format!("line {line_no}: {err}")))?;
        match record {
            Record::Header(parsed) => {
                if header.is_some() {
                    return Err(corrupt(format!("line {line_no}: second session header")));
                }
                header = Some(parsed);
            }
            Record::Message(message) => {
                if header.is_none() {
                    return Err(corrupt(format!("line {line_no}: message before header")));
                }
                messages.push(message);
            }
        }
    }

    let header = header.ok_or_else(|| corrupt("missing session header".to_string()))?;
    let last_message_at = messages.last().map(|message: &Message| message.timestamp);
    let updated_at = [Some(header.created_at), header.updated_at, last_message_at]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(header.created_at);

    let session = Session {
        id: header.id,
        bot_id: header.bot_id,
        created_at: header.created_at,
        updated_at,
        messages,
    };
    session.validate_history().map_err(corrupt)?;

    Ok(LoadedSession {
        session,
        valid_len: offset_of_intact_prefix(bytes),
        file_len: bytes.len() as u64,
    })
}

fn offset_of_intact_prefix(bytes: &[u8]) -> u64 {
    memchr::memrchr(b'\n', bytes).map_or(0, |pos| pos as u64 + 1)
}

impl Inner {
    fn sessions_dir(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    fn bots_dir(&self) -> PathBuf {
        self.root.join(BOTS_DIR)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.jsonl"))
    }

    fn bot_path(&self, id: &str) -> PathBuf {
        self.bots_dir().join(format!("{id}.json"))
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_session(&self, id: &str) -> Result<LoadedSession, StoreError> {
        check_session_id(id)?;
        let path = self.session_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::session_not_found(id));
            }
            Err(err) => return Err(err.into()),
        };
        parse_session_file(&path, &bytes)
    }

    fn create_session(&self, bot_id: Option<String>) -> Result<Session, StoreError> {
        let _guard = self.write_guard();
        loop {
            let session = Session::new(new_session_id(), bot_id.clone());
            let path = self.session_path(&session.id);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            };
            let header = Record::Header(SessionHeader {
                id: session.id.clone(),
                bot_id: session.bot_id.clone(),
                created_at: session.created_at,
                updated_at: None,
            });
            file.write_all(&record_line(&header)?)?;
            file.sync_data()?;
            debug!(session_id = %session.id, "Created session");
            return Ok(session);
        }
    }

    fn append_message(&self, id: &str, draft: NewMessage) -> Result<Message, StoreError> {
        let _guard = self.write_guard();
        let loaded = self.read_session(id)?;
        loaded
            .session
            .validate_append(&draft)
            .map_err(StoreError::InvalidMessage)?;

        let message = draft.into_message(loaded.session.next_seq(), Utc::now());
        let line = record_line(&Record::Message(message.clone()))?;

        let mut file = OpenOptions::new().write(true).open(self.session_path(id))?;
        if loaded.file_len > loaded.valid_len {
            warn!(
                session_id = %id,
                discarded = loaded.file_len - loaded.valid_len,
                "Truncating torn record before append"
            );
            file.set_len(loaded.valid_len)?;
        }
        file.seek(SeekFrom::Start(loaded.valid_len))?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(message)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(self.sessions_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.read_session(id) {
                Ok(loaded) if loaded.session.matches(filter) => {
                    summaries.push(loaded.session.summary())
                }
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable session"),
            }
        }
        Ok(finish_listing(summaries, filter.limit))
    }

    fn import_session(&self, session: Session) -> Result<Session, StoreError> {
        check_session_id(&session.id)?;
        session
            .validate_history()
            .map_err(StoreError::InvalidMessage)?;

        let _guard = self.write_guard();
        let path = self.session_path(&session.id);
        let already_exists = || StoreError::AlreadyExists {
            kind: "session",
            id: session.id.clone(),
        };
        if path.exists() {
            return Err(already_exists());
        }

        let mut bytes = record_line(&Record::Header(SessionHeader {
            id: session.id.clone(),
            bot_id: session.bot_id.clone(),
            created_at: session.created_at,
            updated_at: Some(session.updated_at),
        }))?;
        for message in &session.messages {
            bytes.extend(record_line(&Record::Message(message.clone()))?);
        }

        let mut temp = NamedTempFile::new_in(self.sessions_dir())?;
        temp.write_all(&bytes)?;
        temp.as_file_mut().sync_all()?;
        temp.persist_noclobber(&path).map_err(|err| {
            if err.error.kind() == io::ErrorKind::AlreadyExists {
                already_exists()
            } else {
                StoreError::Io(err.error)
            }
        })?;
        Ok(session)
    }

    fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        check_session_id(id)?;
        let _guard = self.write_guard();
        match fs::remove_file(self.session_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::session_not_found(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_bot_versions(&self, id: &str) -> Result<Vec<Bot>, StoreError> {
        validate_bot_id(id).map_err(|_| StoreError::bot_not_found(id))?;
        let path = self.bot_path(id);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::bot_not_found(id));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&contents).map_err(|err| StoreError::Corrupt {
            path,
            detail: err.to_string(),
        })
    }

    fn save_bot(&self, mut bot: Bot) -> Result<Bot, StoreError> {
        validate_bot_id(&bot.id).map_err(StoreError::InvalidMessage)?;
        let _guard = self.write_guard();
        let mut versions = match self.read_bot_versions(&bot.id) {
            Ok(versions) => versions,
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        bot.version = versions.last().map_or(1, |latest| latest.version + 1);
        versions.push(bot.clone());
        let bytes = serde_json::to_vec_pretty(&versions)?;
        write_atomic(&self.bots_dir(), &self.bot_path(&bot.id), &bytes)?;
        debug!(bot_id = %bot.id, version = bot.version, "Saved bot");
        Ok(bot)
    }

    fn list_bots(&self) -> Result<Vec<Bot>, StoreError> {
        let mut bots = Vec::new();
        for entry in fs::read_dir(self.bots_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.read_bot_versions(id) {
                Ok(mut versions) => bots.extend(versions.pop()),
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable bot"),
            }
        }
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    fn remove_bot(&self, id: &str) -> Result<(), StoreError> {
        validate_bot_id(id).map_err(|_| StoreError::bot_not_found(id))?;
        let _guard = self.write_guard();
        match fs::remove_file(self.bot_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::bot_not_found(id)),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn create(&self, bot_id: Option<&str>) -> Result<Session, StoreError> {
        let bot_id = bot_id.map(str::to_string);
        self.blocking(move |inner| inner.create_session(bot_id)).await
    }

    async fn load(&self, id: &str) -> Result<Session, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.read_session(&id).map(|loaded| loaded.session))
            .await
    }

    async fn append(&self, id: &str, message: NewMessage) -> Result<Message, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.append_message(&id, message))
            .await
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |inner| inner.list_sessions(&filter)).await
    }

    async fn import(&self, session: Session) -> Result<Session, StoreError> {
        self.blocking(move |inner| inner.import_session(session))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.delete_session(&id)).await
    }
}

#[async_trait]
impl BotStore for FileStore {
    async fn load_bot(&self, id: &str) -> Result<Bot, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| {
            inner
                .read_bot_versions(&id)?
                .pop()
                .ok_or_else(|| StoreError::bot_not_found(&id))
        })
        .await
    }

    async fn save_bot(&self, bot: Bot) -> Result<Bot, StoreError> {
        self.blocking(move |inner| inner.save_bot(bot)).await
    }

    async fn list_bots(&self) -> Result<Vec<Bot>, StoreError> {
        self.blocking(|inner| inner.list_bots()).await
    }

    async fn remove_bot(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.remove_bot(&id)).await
    }
}

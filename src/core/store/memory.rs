use super::{check_session_id, BotStore, SessionStore, StoreError};
use crate::core::bot::{validate_bot_id, Bot};
use crate::core::message::{Message, NewMessage};
use crate::core::session::{finish_listing, Session, SessionFilter, SessionSummary};
use crate::utils::ids::new_session_id;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local store. Locks are never held across an await.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    bots: Mutex<HashMap<String, Vec<Bot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, bot_id: Option<&str>) -> Result<Session, StoreError> {
        let mut sessions = lock(&self.sessions);
        let id = loop {
            let candidate = new_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session::new(id.clone(), bot_id.map(str::to_string));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn load(&self, id: &str) -> Result<Session, StoreError> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::session_not_found(id))
    }

    async fn append(&self, id: &str, message: NewMessage) -> Result<Message, StoreError> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::session_not_found(id))?;
        session
            .validate_append(&message)
            .map_err(StoreError::InvalidMessage)?;
        let now = Utc::now();
        let stored = message.into_message(session.next_seq(), now);
        session.messages.push(stored.clone());
        session.updated_at = now;
        Ok(stored)
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let summaries = lock(&self.sessions)
            .values()
            .filter(|session| session.matches(filter))
            .map(Session::summary)
            .collect();
        Ok(finish_listing(summaries, filter.limit))
    }

    async fn import(&self, session: Session) -> Result<Session, StoreError> {
        check_session_id(&session.id)?;
        session
            .validate_history()
            .map_err(StoreError::InvalidMessage)?;
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists {
                kind: "session",
                id: session.id,
            });
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        lock(&self.sessions)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::session_not_found(id))
    }
}

#[async_trait]
impl BotStore for MemoryStore {
    async fn load_bot(&self, id: &str) -> Result<Bot, StoreError> {
        lock(&self.bots)
            .get(id)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| StoreError::bot_not_found(id))
    }

    async fn save_bot(&self, mut bot: Bot) -> Result<Bot, StoreError> {
        validate_bot_id(&bot.id).map_err(StoreError::InvalidMessage)?;
        let mut bots = lock(&self.bots);
        let versions = bots.entry(bot.id.clone()).or_default();
        bot.version = versions.last().map_or(1, |latest| latest.version + 1);
        versions.push(bot.clone());
        Ok(bot)
    }

    async fn list_bots(&self) -> Result<Vec<Bot>, StoreError> {
        let mut latest: Vec<Bot> = lock(&self.bots)
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(latest)
    }

    async fn remove_bot(&self, id: &str) -> Result<(), StoreError> {
        lock(&self.bots)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::bot_not_found(id))
    }
}

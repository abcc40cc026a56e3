use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::settings::{Message, Session, PLACEHOLDER_TITLE};
use crate::store::SettingsStore;

pub const TITLE_PREFIX_CHARS: usize = 30;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default()
    }
}

/// History list entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub timestamp: f64,
    /// Local time of the last interaction, for display.
    pub updated_at: String,
    pub message_count: usize,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<SettingsStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create_session(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            title: PLACEHOLDER_TITLE.to_string(),
            timestamp: self.clock.now(),
            messages: Vec::new(),
        };
        self.store.update(|settings| {
            settings.sessions.insert(id.clone(), session);
            Ok(())
        })?;
        info!(session = %id, "created session");
        Ok(id)
    }

    /// Records one completed exchange: the user query, then the reply.
    pub fn save_interaction(&self, session_id: &str, query: &str, response: &str) -> Result<()> {
        let now = self.clock.now();
        self.store.update(|settings| {
            let session = settings
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    debug!(session = %session_id, "unknown session; creating it");
                    Session {
                        id: session_id.to_string(),
                        title: PLACEHOLDER_TITLE.to_string(),
                        timestamp: now,
                        messages: Vec::new(),
                    }
                });

            if session.messages.is_empty() || session.title == PLACEHOLDER_TITLE {
                session.title = session_title(query);
            }
            session.messages.push(Message::user(query));
            session.messages.push(Message::assistant(response));
            session.timestamp = now;
            Ok(())
        })
    }

    /// All sessions, most recently used first.
    pub fn get_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self.store.read(|settings| {
            settings
                .sessions
                .values()
                .map(|session| SessionSummary {
                    id: session.id.clone(),
                    title: session.title.clone(),
                    timestamp: session.timestamp,
                    updated_at: display_time(session.timestamp),
                    message_count: session.messages.len(),
                })
                .collect()
        });
        summaries.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        summaries
    }

    /// Returns whether a session was removed. Unknown ids leave the file alone.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        if !self
            .store
            .read(|settings| settings.sessions.contains_key(session_id))
        {
            return Ok(false);
        }
        let removed = self
            .store
            .update(|settings| Ok(settings.sessions.remove(session_id).is_some()))?;
        if removed {
            info!(session = %session_id, "deleted session");
        }
        Ok(removed)
    }

    pub fn get_session_messages(&self, session_id: &str) -> Vec<Message> {
        self.store.read(|settings| {
            settings
                .sessions
                .get(session_id)
                .map(|session| session.messages.clone())
                .unwrap_or_default()
        })
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.store
            .read(|settings| settings.sessions.contains_key(session_id))
    }
}

fn display_time(timestamp: f64) -> String {
    DateTime::from_timestamp_millis((timestamp * 1000.0) as i64)
        .map(|utc| utc.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

pub fn session_title(query: &str) -> String {
    let prefix: String = query.chars().take(TITLE_PREFIX_CHARS).collect();
    format!("{prefix}...")
}

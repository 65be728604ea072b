mod messages;
mod tasks;
pub mod types;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub use types::{
    ChatInfo, ContextMode, RouterCursor, RunStatus, ScheduleType, ScheduledTask, StoredMessage,
    TaskRunLog, TaskStatus, format_timestamp, normalize_timestamp, now_timestamp,
    parse_local_datetime, parse_timestamp,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chats (
        chat_id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        last_message_time TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        sender_name TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (id, chat_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_timestamp_id ON messages(timestamp, id)",
    "CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        group_folder TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        schedule_value TEXT NOT NULL,
        context_mode TEXT NOT NULL DEFAULT 'isolated',
        next_run TEXT,
        last_run TEXT,
        last_result TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due ON scheduled_tasks(status, next_run)",
    "CREATE TABLE IF NOT EXISTS task_run_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        run_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        result TEXT,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at)",
];

/// SQLite-backed durable message log plus the scheduled task tables.
///
/// The bridge ingest path is the only writer of `messages`/`chats`; the
/// scheduler and IPC task mutations are the only writers of the task tables.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Connection>>,
}

impl MessageStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let db = Connection::open(path)
            .with_context(|| format!("opening message store {}", path.display()))?;
        NativePlatform::restrict_file_permissions(path);
        Self::init_schema(&db)?;
        info!("Message store ready at {:?}", path);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.pragma_update(None, "journal_mode", "WAL").ok();
        for statement in SCHEMA {
            db.execute(statement, [])?;
        }
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
pub fn test_store() -> MessageStore {
    MessageStore::open_in_memory().expect("open in-memory store")
}

#[cfg(test)]
impl MessageStore {
    /// Runs raw SQL so tests can take tables away underneath a running component.
    pub async fn execute_sql(&self, sql: &str) -> Result<()> {
        self.db.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

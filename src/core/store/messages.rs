use anyhow::Result;
use rusqlite::{params, params_from_iter};

use super::MessageStore;
use super::types::{ChatInfo, RouterCursor, StoredMessage};

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

impl MessageStore {
    /// Upsert by the composite `(id, chat_id)` key.
    pub async fn store_message(&self, msg: &StoredMessage) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO messages (id, chat_id, sender, sender_name, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.id,
                msg.chat_id,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp
            ],
        )?;
        Ok(())
    }

    /// Record chat activity. `last_message_time` only moves forward; a `None` name keeps the old one.
    pub async fn store_chat_metadata(
        &self,
        chat_id: &str,
        timestamp: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO chats (chat_id, name, last_message_time) VALUES (?1, COALESCE(?3, ''), ?2)
             ON CONFLICT(chat_id) DO UPDATE SET
                name = COALESCE(?3, chats.name),
                last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
            params![chat_id, timestamp, name],
        )?;
        Ok(())
    }

    pub async fn update_chat_name(&self, chat_id: &str, name: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO chats (chat_id, name, last_message_time) VALUES (?1, ?2, '')
             ON CONFLICT(chat_id) DO UPDATE SET name = excluded.name",
            params![chat_id, name],
        )?;
        Ok(())
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatInfo>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT chat_id, name, last_message_time FROM chats ORDER BY last_message_time DESC, chat_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChatInfo {
                chat_id: row.get(0)?,
                name: row.get(1)?,
                last_message_time: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Messages strictly after `cursor` in `(timestamp, id)` order, limited to `chat_ids`,
    /// skipping the assistant's own replies.
    pub async fn get_new_messages(
        &self,
        chat_ids: &[String],
        cursor: &RouterCursor,
        reply_prefix: &str,
    ) -> Result<Vec<StoredMessage>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..chat_ids.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, chat_id, sender, sender_name, content, timestamp FROM messages
             WHERE (timestamp > ?1 OR (timestamp = ?1 AND id > ?2))
               AND substr(content, 1, length(?3)) <> ?3
               AND chat_id IN ({})
             ORDER BY timestamp, id",
            placeholders
        );

        let mut bind: Vec<&str> = vec![
            cursor.timestamp.as_str(),
            cursor.message_id.as_str(),
            reply_prefix,
        ];
        bind.extend(chat_ids.iter().map(String::as_str));

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), row_to_message)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Context window for one conversation: everything after `since` up to and including `until`.
    pub async fn get_messages_since(
        &self,
        chat_id: &str,
        since: Option<&str>,
        until: &RouterCursor,
        reply_prefix: &str,
    ) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, chat_id, sender, sender_name, content, timestamp FROM messages
             WHERE chat_id = ?1
               AND timestamp > ?2
               AND (timestamp < ?3 OR (timestamp = ?3 AND id <= ?4))
               AND substr(content, 1, length(?5)) <> ?5
             ORDER BY timestamp, id",
        )?;
        let rows = stmt.query_map(
            params![
                chat_id,
                since.unwrap_or(""),
                until.timestamp,
                until.message_id,
                reply_prefix
            ],
            row_to_message,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

//! The chat transport, seen from the kernel.
//!
//! The kernel never speaks a messaging protocol itself. It talks to a bridge
//! through the [`Bridge`] trait and consumes the events the bridge produces.

mod ingest;
mod process;

pub use ingest::BridgeIngest;
pub use process::ProcessBridge;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// `[bridge]` table of `kernel.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Program and arguments of the bridge process. Empty runs the kernel without a transport.
    pub command: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a command waits for the bridge's `response` line.
    pub request_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Paused,
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Open,
    Connecting,
    Close,
}

/// One line a bridge writes to its stdout, other than command responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    Message {
        id: String,
        #[serde(alias = "chatJid")]
        chat_id: String,
        sender: String,
        #[serde(default)]
        sender_name: String,
        content: String,
        timestamp: String,
        #[serde(default)]
        chat_name: Option<String>,
    },
    Connection {
        status: ConnectionStatus,
    },
    #[serde(alias = "contactsUpdate")]
    ContactsUpdate {
        alias: String,
        canonical: String,
    },
    Groups {
        groups: HashMap<String, String>,
    },
}

#[async_trait]
pub trait Bridge: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;

    async fn send_presence(&self, chat_id: &str, presence: Presence) -> Result<()>;

    /// Group chat id -> display name, as the transport currently sees it.
    async fn fetch_groups(&self) -> Result<HashMap<String, String>>;

    async fn place_call(&self, chat_id: &str, _reason: &str) -> Result<()> {
        bail!("bridge cannot place calls (requested for {})", chat_id)
    }
}

/// Used when no bridge command is configured. Outbound traffic is logged and dropped.
pub struct NullBridge;

#[async_trait]
impl Bridge for NullBridge {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        info!(
            "[bridge] No transport configured, dropping {} byte message to {}",
            text.len(),
            chat_id
        );
        Ok(())
    }

    async fn send_presence(&self, _chat_id: &str, _presence: Presence) -> Result<()> {
        Ok(())
    }

    async fn fetch_groups(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_event_with_aliases() {
        let line = r#"{"type":"message","id":"m1","chatJid":"g@g.us","sender":"u@s","senderName":"Ann","content":"@Andy hi","timestamp":"2024-01-01T00:00:00.000Z","fromMe":false}"#;
        let event: BridgeEvent = serde_json::from_str(line).unwrap();
        match event {
            BridgeEvent::Message {
                chat_id,
                sender_name,
                chat_name,
                ..
            } => {
                assert_eq!(chat_id, "g@g.us");
                assert_eq!(sender_name, "Ann");
                assert_eq!(chat_name, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_control_events() {
        let conn: BridgeEvent =
            serde_json::from_str(r#"{"type":"connection","status":"open"}"#).unwrap();
        assert_eq!(
            conn,
            BridgeEvent::Connection {
                status: ConnectionStatus::Open
            }
        );

        let contacts: BridgeEvent = serde_json::from_str(
            r#"{"type":"contactsUpdate","alias":"1@lid","canonical":"2@s"}"#,
        )
        .unwrap();
        assert!(matches!(contacts, BridgeEvent::ContactsUpdate { .. }));

        assert!(serde_json::from_str::<BridgeEvent>(r#"{"type":"typing"}"#).is_err());
    }

    #[test]
    fn bridge_config_defaults() {
        let config: BridgeConfig = toml::from_str("command = [\"node\", \"b.js\"]").unwrap();
        assert_eq!(config.command, vec!["node", "b.js"]);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.backoff_max_ms, 60_000);
    }

    #[tokio::test]
    async fn null_bridge_cannot_call() {
        let bridge = NullBridge;
        assert!(bridge.send_message("x", "hi").await.is_ok());
        assert!(bridge.fetch_groups().await.unwrap().is_empty());
        assert!(bridge.place_call("x", "urgent").await.is_err());
    }
}

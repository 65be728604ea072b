//! Turns bridge events into durable log rows and state updates.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeEvent, ConnectionStatus};
use crate::core::groups::GroupSync;
use crate::core::state::KernelState;
use crate::core::store::{MessageStore, StoredMessage, normalize_timestamp, now_timestamp};

pub struct BridgeIngest {
    store: MessageStore,
    state: Arc<KernelState>,
    groups: Arc<GroupSync>,
}

impl BridgeIngest {
    pub fn new(store: MessageStore, state: Arc<KernelState>, groups: Arc<GroupSync>) -> Self {
        Self {
            store,
            state,
            groups,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BridgeEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = self.handle_event(event).await {
                    warn!("[ingest] Event handling failed: {:#}", e);
                }
            }
            info!("[ingest] Stopped");
        })
    }

    pub async fn handle_event(&self, event: BridgeEvent) -> Result<()> {
        match event {
            BridgeEvent::Message {
                id,
                chat_id,
                sender,
                sender_name,
                content,
                timestamp,
                chat_name,
            } => {
                let chat_id = self.state.resolve_alias(&chat_id);
                let timestamp = normalize_timestamp(&timestamp).unwrap_or_else(|| {
                    warn!(
                        "[ingest] Message {} has unparseable timestamp '{}', using now",
                        id, timestamp
                    );
                    now_timestamp()
                });

                self.store
                    .store_chat_metadata(&chat_id, &timestamp, chat_name.as_deref())
                    .await?;
                if self.state.conversation(&chat_id).is_none() {
                    debug!("[ingest] {} is not registered, metadata only", chat_id);
                    return Ok(());
                }
                self.store
                    .store_message(&StoredMessage {
                        id,
                        chat_id,
                        sender,
                        sender_name,
                        content,
                        timestamp,
                    })
                    .await
            }
            BridgeEvent::Connection { status } => {
                info!("[ingest] Transport connection: {:?}", status);
                if status == ConnectionStatus::Open
                    && let Err(e) = self.groups.sync_groups(false).await
                {
                    warn!("[ingest] Group sync after connect failed: {:#}", e);
                }
                Ok(())
            }
            BridgeEvent::ContactsUpdate { alias, canonical } => {
                self.state.set_alias(&alias, &canonical);
                Ok(())
            }
            BridgeEvent::Groups { groups } => self.groups.update_names(&groups).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::KernelConfig;
    use crate::core::groups::{GroupRegistration, register_group};
    use crate::core::store::{RouterCursor, test_store};
    use crate::core::testing::RecordingBridge;
    use std::collections::HashMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: MessageStore,
        state: Arc<KernelState>,
        bridge: Arc<RecordingBridge>,
        ingest: BridgeIngest,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(KernelConfig {
            data_dir: dir.path().to_path_buf(),
            ..KernelConfig::default()
        });
        let state = Arc::new(KernelState::load(config.state_dir()).unwrap());
        register_group(
            &config,
            &state,
            GroupRegistration {
                chat_id: "555@s".to_string(),
                folder: "main".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let store = test_store();
        let bridge = Arc::new(RecordingBridge::default());
        let groups = Arc::new(GroupSync::new(
            config,
            store.clone(),
            state.clone(),
            bridge.clone(),
        ));
        let ingest = BridgeIngest::new(store.clone(), state.clone(), groups);
        Fixture {
            _dir: dir,
            store,
            state,
            bridge,
            ingest,
        }
    }

    fn message(id: &str, chat_id: &str) -> BridgeEvent {
        BridgeEvent::Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender: "u@s".to_string(),
            sender_name: "Una".to_string(),
            content: "hello".to_string(),
            timestamp: "2024-01-01T12:00:00+01:00".to_string(),
            chat_name: Some("Chat".to_string()),
        }
    }

    async fn logged(store: &MessageStore, chat: &str) -> usize {
        store
            .get_new_messages(&[chat.to_string()], &RouterCursor::default(), "Andy:")
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn only_registered_chats_reach_the_log() {
        let f = fixture();
        f.ingest.handle_event(message("m1", "555@s")).await.unwrap();
        f.ingest.handle_event(message("m2", "stranger@s")).await.unwrap();

        assert_eq!(logged(&f.store, "555@s").await, 1);
        assert_eq!(logged(&f.store, "stranger@s").await, 0);

        let chats = f.store.list_chats().await.unwrap();
        assert_eq!(chats.len(), 2);
        assert!(chats.iter().all(|c| c.last_message_time == "2024-01-01T11:00:00.000Z"));
    }

    #[tokio::test]
    async fn aliases_are_canonicalized_before_storing() {
        let f = fixture();
        f.ingest
            .handle_event(BridgeEvent::ContactsUpdate {
                alias: "77@lid".to_string(),
                canonical: "555@s".to_string(),
            })
            .await
            .unwrap();
        f.ingest.handle_event(message("m1", "77@lid")).await.unwrap();
        assert_eq!(logged(&f.store, "555@s").await, 1);
        assert_eq!(f.state.resolve_alias("77@lid"), "555@s");
    }

    #[tokio::test]
    async fn connection_open_triggers_group_sync() {
        let f = fixture();
        f.bridge
            .groups
            .lock()
            .insert("g@g.us".to_string(), "Garden".to_string());
        f.ingest
            .handle_event(BridgeEvent::Connection {
                status: ConnectionStatus::Open,
            })
            .await
            .unwrap();
        let chats = f.store.list_chats().await.unwrap();
        assert_eq!(chats[0].name, "Garden");

        let mut names = HashMap::new();
        names.insert("g@g.us".to_string(), "Garden Club".to_string());
        f.ingest
            .handle_event(BridgeEvent::Groups { groups: names })
            .await
            .unwrap();
        assert_eq!(f.store.list_chats().await.unwrap()[0].name, "Garden Club");
    }
}

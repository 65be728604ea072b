//! Message-arrival worker runs.
//!
//! The router walks the durable log in `(timestamp, id)` order from its cursor.
//! The cursor moves past a message only once that message is fully handled, so a
//! crash replays at most the message that was in flight.

mod trigger;

use trigger::TriggerCache;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::KernelConfig;
use crate::core::container::{WorkerInput, WorkerRunner};
use crate::core::state::{Conversation, KernelState};
use crate::core::store::{MessageStore, StoredMessage};
use crate::interfaces::bridge::{Bridge, Presence};

pub struct MessageRouter {
    config: Arc<KernelConfig>,
    store: MessageStore,
    state: Arc<KernelState>,
    bridge: Arc<dyn Bridge>,
    runner: Arc<dyn WorkerRunner>,
    triggers: TriggerCache,
}

impl MessageRouter {
    pub fn new(
        config: Arc<KernelConfig>,
        store: MessageStore,
        state: Arc<KernelState>,
        bridge: Arc<dyn Bridge>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        Self {
            config,
            store,
            state,
            bridge,
            runner,
            triggers: TriggerCache::default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.router_poll_ms.max(1));
        info!(
            "[router] Routing for {} (trigger {}) every {} ms",
            self.config.assistant_name,
            self.config.default_trigger(),
            poll.as_millis()
        );
        loop {
            if let Err(e) = self.poll_once(&cancel).await {
                error!("[router] Batch aborted, retrying next tick: {:#}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!("[router] Stopped");
    }

    /// Route every message past the cursor. Returns how many messages were consumed.
    /// An error leaves the cursor on the last fully handled message. Cancellation is
    /// only observed between messages.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let chat_ids = self.state.registered_chat_ids();
        if chat_ids.is_empty() {
            return Ok(0);
        }

        let cursor = self.state.cursor();
        let prefix = self.config.reply_prefix();
        let messages = self
            .store
            .get_new_messages(&chat_ids, &cursor, &prefix)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }
        debug!("[router] {} new message(s) after {:?}", messages.len(), cursor);

        let mut handled = 0;
        for msg in messages {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(conversation) = self.state.conversation(&msg.chat_id) {
                if self.should_respond(&conversation, &msg) {
                    self.handle_message(&conversation, &msg).await?;
                } else {
                    debug!("[router] {} in '{}' has no trigger", msg.id, conversation.folder);
                }
            }
            self.state.advance_cursor(msg.cursor())?;
            handled += 1;
        }
        Ok(handled)
    }

    fn should_respond(&self, conversation: &Conversation, msg: &StoredMessage) -> bool {
        conversation.is_main || self.triggers.matches(&conversation.trigger, &msg.content)
    }

    /// Runs the worker for one message. Worker failures are final for the message and
    /// produce no reply; only store errors propagate.
    async fn handle_message(&self, conversation: &Conversation, msg: &StoredMessage) -> Result<()> {
        let folder = &conversation.folder;
        let lock = self.state.run_lock(folder);
        let _guard = lock.lock().await;

        let since = self.state.last_agent_run(&conversation.chat_id);
        let mut history = self
            .store
            .get_messages_since(
                &conversation.chat_id,
                since.as_deref(),
                &msg.cursor(),
                &self.config.reply_prefix(),
            )
            .await?;
        // messages sharing the last run's timestamp fall outside the window
        if !history.iter().any(|m| m.id == msg.id) {
            history.push(msg.clone());
        }
        let prompt = format_context(&history);

        info!(
            "[router] Processing {} message(s) for '{}' (triggered by {})",
            history.len(),
            folder,
            msg.id
        );

        self.presence(&conversation.chat_id, Presence::Composing).await;
        let input = WorkerInput {
            prompt,
            session_id: self.state.session(folder),
            workspace_folder: folder.clone(),
            chat_id: conversation.chat_id.clone(),
            is_main: conversation.is_main,
            is_scheduled_task: false,
        };
        let outcome = self
            .runner
            .run(input, &conversation.mount_config.additional_mounts)
            .await;

        match outcome {
            Ok(output) => {
                if let Some(session) = output.new_session_id.as_deref() {
                    self.state.set_session(folder, session);
                }
                self.state
                    .set_last_agent_run(&conversation.chat_id, &msg.timestamp);

                match output.result.as_deref().map(str::trim) {
                    Some(text) if !text.is_empty() => {
                        let reply = format!("{} {}", self.config.reply_prefix(), text);
                        if let Err(e) = self.bridge.send_message(&conversation.chat_id, &reply).await {
                            error!("[router] Could not deliver reply to {}: {:#}", conversation.chat_id, e);
                        }
                    }
                    _ => debug!("[router] Worker for '{}' returned no text", folder),
                }
            }
            Err(e) => {
                warn!("[router] No reply for {} in '{}': {}", msg.id, folder, e);
            }
        }
        self.presence(&conversation.chat_id, Presence::Paused).await;
        Ok(())
    }

    async fn presence(&self, chat_id: &str, presence: Presence) {
        if let Err(e) = self.bridge.send_presence(chat_id, presence).await {
            debug!("[router] Presence update for {} failed: {:#}", chat_id, e);
        }
    }
}

/// Renders a conversation slice as the worker's prompt.
pub fn format_context(messages: &[StoredMessage]) -> String {
    let mut out = String::from("<messages>\n");
    for msg in messages {
        let sender = if msg.sender_name.is_empty() {
            &msg.sender
        } else {
            &msg.sender_name
        };
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            escape_xml(sender),
            escape_xml(&msg.timestamp),
            escape_xml(&msg.content)
        ));
    }
    out.push_str("</messages>");
    out
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

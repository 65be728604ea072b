//! Shared coordination state: registered conversations, worker sessions, the
//! router cursor, per-conversation last worker run, and the identity alias table.
//!
//! Every sub-map has its own lock and its own JSON file under `<data>/state`.
//! All writers go through the methods here; file writes are serialized by
//! `persist_lock` so an older snapshot can never overwrite a newer one.

mod persist;

pub(crate) use persist::write_json_atomic;

use anyhow::{Result, bail};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::core::config::is_valid_folder_name;
use crate::core::mounts::MountRequest;
use crate::core::store::RouterCursor;

const GROUPS_FILE: &str = "registered_groups.json";
const SESSIONS_FILE: &str = "sessions.json";
const ROUTER_FILE: &str = "router_state.json";
const ALIASES_FILE: &str = "aliases.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    #[serde(default)]
    pub additional_mounts: Vec<MountRequest>,
}

/// A registered chat and the workspace folder its worker runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub chat_id: String,
    #[serde(default)]
    pub name: String,
    pub folder: String,
    pub trigger: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub mount_config: MountConfig,
    #[serde(default)]
    pub added_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterState {
    #[serde(default)]
    cursor: RouterCursor,
    #[serde(default)]
    last_agent_run: HashMap<String, String>,
}

pub struct KernelState {
    dir: PathBuf,
    groups: RwLock<HashMap<String, Conversation>>,
    sessions: RwLock<HashMap<String, String>>,
    router: RwLock<RouterState>,
    aliases: RwLock<HashMap<String, String>>,
    sessions_dirty: AtomicBool,
    router_dirty: AtomicBool,
    aliases_dirty: AtomicBool,
    persist_lock: Mutex<()>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KernelState {
    /// Load every sub-map from `dir`. A missing file is an empty map.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let groups: HashMap<String, Conversation> = persist::read_json(&dir.join(GROUPS_FILE))?;
        let sessions: HashMap<String, String> = persist::read_json(&dir.join(SESSIONS_FILE))?;
        let router: RouterState = persist::read_json(&dir.join(ROUTER_FILE))?;
        let aliases: HashMap<String, String> = persist::read_json(&dir.join(ALIASES_FILE))?;

        info!(
            "[state] Loaded {} conversation(s), {} session(s), cursor at ({}, {})",
            groups.len(),
            sessions.len(),
            router.cursor.timestamp,
            router.cursor.message_id
        );

        Ok(Self {
            dir,
            groups: RwLock::new(groups),
            sessions: RwLock::new(sessions),
            router: RwLock::new(router),
            aliases: RwLock::new(aliases),
            sessions_dirty: AtomicBool::new(false),
            router_dirty: AtomicBool::new(false),
            aliases_dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
            run_locks: Mutex::new(HashMap::new()),
        })
    }

    // --- Conversations ---

    pub fn conversations(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self.groups.read().values().cloned().collect();
        all.sort_by(|a, b| a.folder.cmp(&b.folder).then(a.chat_id.cmp(&b.chat_id)));
        all
    }

    pub fn conversation(&self, chat_id: &str) -> Option<Conversation> {
        self.groups.read().get(chat_id).cloned()
    }

    pub fn conversation_by_folder(&self, folder: &str) -> Option<Conversation> {
        self.groups
            .read()
            .values()
            .filter(|c| c.folder == folder)
            .min_by(|a, b| a.chat_id.cmp(&b.chat_id))
            .cloned()
    }

    pub fn registered_chat_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert or replace a conversation and persist the registry before returning.
    pub fn register_conversation(&self, conversation: Conversation) -> Result<()> {
        if conversation.chat_id.trim().is_empty() {
            bail!("conversation chat id must not be empty");
        }
        if !is_valid_folder_name(&conversation.folder) {
            bail!("invalid conversation folder '{}'", conversation.folder);
        }

        let _guard = self.persist_lock.lock();
        let snapshot = {
            let mut groups = self.groups.write();
            groups.insert(conversation.chat_id.clone(), conversation.clone());
            groups.clone()
        };
        persist::write_json_atomic(&self.dir.join(GROUPS_FILE), &snapshot)?;
        info!(
            "[state] Registered conversation {} -> folder '{}' (main: {})",
            conversation.chat_id, conversation.folder, conversation.is_main
        );
        Ok(())
    }

    // --- Sessions ---

    pub fn session(&self, folder: &str) -> Option<String> {
        self.sessions.read().get(folder).cloned()
    }

    pub fn set_session(&self, folder: &str, session_id: &str) {
        let mut sessions = self.sessions.write();
        if sessions.get(folder).map(String::as_str) != Some(session_id) {
            sessions.insert(folder.to_string(), session_id.to_string());
            self.sessions_dirty.store(true, Ordering::Release);
        }
    }

    // --- Router cursor and last worker run ---

    pub fn cursor(&self) -> RouterCursor {
        self.router.read().cursor.clone()
    }

    /// Move the cursor forward and write it through to disk.
    /// Returns `false` (and writes nothing) when `next` is not ahead of the current cursor.
    pub fn advance_cursor(&self, next: RouterCursor) -> Result<bool> {
        let _guard = self.persist_lock.lock();
        let snapshot = {
            let mut router = self.router.write();
            if next <= router.cursor {
                return Ok(false);
            }
            router.cursor = next;
            router.clone()
        };
        persist::write_json_atomic(&self.dir.join(ROUTER_FILE), &snapshot)?;
        self.router_dirty.store(false, Ordering::Release);
        Ok(true)
    }

    pub fn last_agent_run(&self, chat_id: &str) -> Option<String> {
        self.router.read().last_agent_run.get(chat_id).cloned()
    }

    pub fn set_last_agent_run(&self, chat_id: &str, timestamp: &str) {
        let mut router = self.router.write();
        router
            .last_agent_run
            .insert(chat_id.to_string(), timestamp.to_string());
        self.router_dirty.store(true, Ordering::Release);
    }

    // --- Identity aliases ---

    /// Follow the alias table to the canonical chat id (at most a few hops, cycles stop early).
    pub fn resolve_alias(&self, chat_id: &str) -> String {
        let aliases = self.aliases.read();
        let mut current = chat_id.to_string();
        for _ in 0..8 {
            match aliases.get(&current) {
                Some(next) if *next != current => current = next.clone(),
                _ => break,
            }
        }
        current
    }

    pub fn set_alias(&self, alias: &str, canonical: &str) {
        if alias.is_empty() || canonical.is_empty() || alias == canonical {
            return;
        }
        let mut aliases = self.aliases.write();
        if aliases.get(alias).map(String::as_str) != Some(canonical) {
            aliases.insert(alias.to_string(), canonical.to_string());
            self.aliases_dirty.store(true, Ordering::Release);
        }
    }

    // --- Persistence ---

    /// Write every dirty sub-map. Called by the lifecycle heartbeat and on shutdown.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        if self.sessions_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = self.sessions.read().clone();
            if let Err(e) = persist::write_json_atomic(&self.dir.join(SESSIONS_FILE), &snapshot) {
                self.sessions_dirty.store(true, Ordering::Release);
                return Err(e);
            }
            debug!("[state] Flushed {} session(s)", snapshot.len());
        }
        if self.router_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = self.router.read().clone();
            if let Err(e) = persist::write_json_atomic(&self.dir.join(ROUTER_FILE), &snapshot) {
                self.router_dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        if self.aliases_dirty.swap(false, Ordering::AcqRel) {
            let snapshot = self.aliases.read().clone();
            if let Err(e) = persist::write_json_atomic(&self.dir.join(ALIASES_FILE), &snapshot) {
                self.aliases_dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    // --- Per-conversation run serialization ---

    /// Lock shared by every worker invocation that resumes `folder`'s session.
    pub fn run_lock(&self, folder: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .lock()
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

use serde::Deserialize;

use crate::core::store::{ContextMode, ScheduleType};

/// A request a worker drops into its inbox. Unknown `type`s and missing fields fail to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IpcPayload {
    Message {
        #[serde(alias = "chatJid")]
        chat_id: String,
        text: String,
    },
    #[serde(alias = "scheduleTask")]
    ScheduleTask {
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        #[serde(default, alias = "targetJid")]
        target_chat_id: Option<String>,
        #[serde(default, alias = "groupFolder")]
        target_folder: Option<String>,
    },
    #[serde(alias = "phoneCall")]
    PhoneCall {
        #[serde(alias = "chatJid")]
        chat_id: String,
        #[serde(default)]
        reason: String,
    },
    #[serde(alias = "registerGroup")]
    RegisterGroup {
        #[serde(alias = "jid", alias = "chatJid")]
        chat_id: String,
        #[serde(default)]
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
    },
    #[serde(alias = "refreshGroups")]
    RefreshGroups {},
    #[serde(alias = "pauseTask")]
    PauseTask { task_id: String },
    #[serde(alias = "resumeTask")]
    ResumeTask { task_id: String },
    #[serde(alias = "cancelTask")]
    CancelTask { task_id: String },
}

impl IpcPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcPayload::Message { .. } => "message",
            IpcPayload::ScheduleTask { .. } => "schedule_task",
            IpcPayload::PhoneCall { .. } => "phone_call",
            IpcPayload::RegisterGroup { .. } => "register_group",
            IpcPayload::RefreshGroups {} => "refresh_groups",
            IpcPayload::PauseTask { .. } => "pause_task",
            IpcPayload::ResumeTask { .. } => "resume_task",
            IpcPayload::CancelTask { .. } => "cancel_task",
        }
    }
}

//! Read-only views written into a worker's IPC directory before each spawn.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use crate::core::state::write_json_atomic;
use crate::core::store::{ChatInfo, ScheduledTask, now_timestamp};

pub const TASKS_SNAPSHOT: &str = "currentTasks.json";
pub const GROUPS_SNAPSHOT: &str = "availableGroups.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskView<'a> {
    id: &'a str,
    group_folder: &'a str,
    prompt: &'a str,
    schedule_type: &'a str,
    schedule_value: &'a str,
    status: &'a str,
    next_run: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupView<'a> {
    chat_id: &'a str,
    name: &'a str,
    last_activity: &'a str,
    is_registered: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupsSnapshot<'a> {
    groups: Vec<GroupView<'a>>,
    last_sync: String,
}

/// Main sees every task; other conversations only their own folder's.
pub fn write_tasks_snapshot(
    ipc_dir: &Path,
    folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
) -> Result<()> {
    let visible: Vec<TaskView<'_>> = tasks
        .iter()
        .filter(|t| is_main || t.group_folder == folder)
        .map(|t| TaskView {
            id: &t.id,
            group_folder: &t.group_folder,
            prompt: &t.prompt,
            schedule_type: t.schedule_type.as_str(),
            schedule_value: &t.schedule_value,
            status: t.status.as_str(),
            next_run: t.next_run.as_deref(),
        })
        .collect();
    write_json_atomic(&ipc_dir.join(TASKS_SNAPSHOT), &visible)
}

/// Only main gets the chat list; everyone else gets an empty one.
pub fn write_groups_snapshot(
    ipc_dir: &Path,
    is_main: bool,
    chats: &[ChatInfo],
    registered: &HashSet<String>,
) -> Result<()> {
    let groups = if is_main {
        chats
            .iter()
            .map(|c| GroupView {
                chat_id: &c.chat_id,
                name: &c.name,
                last_activity: &c.last_message_time,
                is_registered: registered.contains(&c.chat_id),
            })
            .collect()
    } else {
        Vec::new()
    };
    let snapshot = GroupsSnapshot {
        groups,
        last_sync: now_timestamp(),
    };
    write_json_atomic(&ipc_dir.join(GROUPS_SNAPSHOT), &snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{ContextMode, ScheduleType, TaskStatus};

    fn task(id: &str, folder: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_id: format!("{folder}@chat"),
            prompt: "ping".to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some("2024-01-01T00:00:00.000Z".to_string()),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn read(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn tasks_snapshot_is_scoped_for_non_main() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![task("t1", "main"), task("t2", "family"), task("t3", "family")];

        write_tasks_snapshot(dir.path(), "family", false, &tasks).unwrap();
        let scoped = read(&dir.path().join(TASKS_SNAPSHOT));
        let ids: Vec<&str> = scoped
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["t2", "t3"]);
        assert_eq!(scoped[0]["groupFolder"], "family");

        write_tasks_snapshot(dir.path(), "main", true, &tasks).unwrap();
        assert_eq!(read(&dir.path().join(TASKS_SNAPSHOT)).as_array().unwrap().len(), 3);
    }

    #[test]
    fn groups_snapshot_only_populated_for_main() {
        let dir = tempfile::tempdir().unwrap();
        let chats = vec![ChatInfo {
            chat_id: "a@g.us".to_string(),
            name: "Alpha".to_string(),
            last_message_time: "2024-01-01T00:00:00.000Z".to_string(),
        }];
        let registered: HashSet<String> = ["a@g.us".to_string()].into_iter().collect();

        write_groups_snapshot(dir.path(), false, &chats, &registered).unwrap();
        assert!(read(&dir.path().join(GROUPS_SNAPSHOT))["groups"]
            .as_array()
            .unwrap()
            .is_empty());

        write_groups_snapshot(dir.path(), true, &chats, &registered).unwrap();
        let snapshot = read(&dir.path().join(GROUPS_SNAPSHOT));
        assert_eq!(snapshot["groups"][0]["chatId"], "a@g.us");
        assert_eq!(snapshot["groups"][0]["isRegistered"], true);
    }
}

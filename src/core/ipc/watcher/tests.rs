use super::*;
use crate::core::mounts::MountRequest;
use crate::core::store::{MessageStore, TaskStatus, test_store};
use crate::core::testing::RecordingBridge;

struct Fixture {
    _dir: tempfile::TempDir,
    config: Arc<KernelConfig>,
    store: MessageStore,
    state: Arc<KernelState>,
    bridge: Arc<RecordingBridge>,
    watcher: IpcWatcher,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(KernelConfig {
        data_dir: dir.path().to_path_buf(),
        ..KernelConfig::default()
    });
    let state = Arc::new(KernelState::load(config.state_dir()).unwrap());
    for (chat, folder) in [("me@s", "main"), ("fam@g.us", "family"), ("work@g.us", "work")] {
        register_group(
            &config,
            &state,
            GroupRegistration {
                chat_id: chat.to_string(),
                folder: folder.to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    }
    let store = test_store();
    let bridge = Arc::new(RecordingBridge::default());
    let tasks = Arc::new(TaskControl::new(store.clone(), state.clone(), config.tz()));
    let groups = Arc::new(GroupSync::new(
        config.clone(),
        store.clone(),
        state.clone(),
        bridge.clone(),
    ));
    let watcher = IpcWatcher::new(config.clone(), state.clone(), bridge.clone(), tasks, groups);
    Fixture {
        _dir: dir,
        config,
        store,
        state,
        bridge,
        watcher,
    }
}

fn drop_file(f: &Fixture, folder: &str, kind: &str, name: &str, body: &str) -> PathBuf {
    let dir = f.config.ipc_folder_dir(folder).join("inbox").join(kind);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn quarantined(f: &Fixture, folder: &str, name: &str) -> bool {
    f.config.ipc_errors_dir().join(folder).join(name).exists()
}

#[tokio::test]
async fn own_chat_message_is_sent_with_prefix() {
    let f = fixture();
    let path = drop_file(
        &f,
        "family",
        "messages",
        "1.json",
        r#"{"type":"message","chatJid":"fam@g.us","text":"dinner at 7"}"#,
    );
    assert_eq!(f.watcher.poll_once().await, 1);
    assert_eq!(
        f.bridge.sent(),
        vec![("fam@g.us".to_string(), "Andy: dinner at 7".to_string())]
    );
    assert!(!path.exists());
}

#[tokio::test]
async fn cross_conversation_message_is_dropped() {
    let f = fixture();
    let path = drop_file(
        &f,
        "family",
        "messages",
        "1.json",
        r#"{"type":"message","chatId":"work@g.us","text":"psst"}"#,
    );
    assert_eq!(f.watcher.poll_once().await, 1);
    assert!(f.bridge.sent().is_empty());
    assert!(!path.exists());
    assert!(!quarantined(&f, "family", "1.json"));
}

#[tokio::test]
async fn main_may_message_any_chat_and_call() {
    let f = fixture();
    drop_file(
        &f,
        "main",
        "messages",
        "1.json",
        r#"{"type":"message","chatId":"work@g.us","text":"hello team"}"#,
    );
    drop_file(
        &f,
        "main",
        "messages",
        "2.json",
        r#"{"type":"phoneCall","chatId":"unregistered@s","reason":"urgent"}"#,
    );
    assert_eq!(f.watcher.poll_once().await, 2);
    assert_eq!(f.bridge.sent().len(), 1);
    assert_eq!(
        f.bridge.calls.lock().clone(),
        vec![("unregistered@s".to_string(), "urgent".to_string())]
    );
}

#[tokio::test]
async fn aliases_resolve_before_authorization() {
    let f = fixture();
    f.state.set_alias("fam-old@g.us", "fam@g.us");
    drop_file(
        &f,
        "family",
        "messages",
        "1.json",
        r#"{"type":"message","chatId":"fam-old@g.us","text":"hi"}"#,
    );
    f.watcher.poll_once().await;
    assert_eq!(f.bridge.sent()[0].0, "fam@g.us");
}

#[tokio::test]
async fn malformed_files_are_quarantined_and_processing_continues() {
    let f = fixture();
    let bad = drop_file(&f, "family", "messages", "1.json", "{not json");
    let unknown = drop_file(&f, "family", "tasks", "2.json", r#"{"type":"self_destruct"}"#);
    drop_file(
        &f,
        "family",
        "messages",
        "3.json",
        r#"{"type":"message","chatId":"fam@g.us","text":"still here"}"#,
    );

    assert_eq!(f.watcher.poll_once().await, 3);
    assert!(!bad.exists());
    assert!(!unknown.exists());
    assert!(quarantined(&f, "family", "1.json"));
    assert!(quarantined(&f, "family", "2.json"));
    assert_eq!(f.bridge.sent().len(), 1);
}

#[tokio::test]
async fn failed_send_is_quarantined() {
    let f = fixture();
    f.bridge
        .fail_sends
        .store(true, std::sync::atomic::Ordering::SeqCst);
    drop_file(
        &f,
        "family",
        "messages",
        "1.json",
        r#"{"type":"message","chatId":"fam@g.us","text":"hi"}"#,
    );
    f.watcher.poll_once().await;
    assert!(quarantined(&f, "family", "1.json"));
}

#[tokio::test]
async fn non_json_files_are_ignored() {
    let f = fixture();
    let partial = drop_file(&f, "family", "messages", "1.json.tmp", "{");
    assert_eq!(f.watcher.poll_once().await, 0);
    assert!(partial.exists());
}

#[tokio::test]
async fn task_requests_are_scoped_to_the_caller() {
    let f = fixture();
    drop_file(
        &f,
        "family",
        "tasks",
        "1.json",
        r#"{"type":"schedule_task","prompt":"remind","scheduleType":"interval","scheduleValue":"60000"}"#,
    );
    drop_file(
        &f,
        "family",
        "tasks",
        "2.json",
        r#"{"type":"schedule_task","prompt":"spy","scheduleType":"interval","scheduleValue":"60000","groupFolder":"work"}"#,
    );
    f.watcher.poll_once().await;

    let tasks = f.store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].group_folder, "family");
    assert_eq!(tasks[0].chat_id, "fam@g.us");

    let id = tasks[0].id.clone();
    drop_file(
        &f,
        "work",
        "tasks",
        "3.json",
        &format!(r#"{{"type":"pause_task","taskId":"{id}"}}"#),
    );
    f.watcher.poll_once().await;
    assert_eq!(
        f.store.get_task(&id).await.unwrap().unwrap().status,
        TaskStatus::Active
    );

    drop_file(
        &f,
        "family",
        "tasks",
        "4.json",
        &format!(r#"{{"type":"pause_task","taskId":"{id}"}}"#),
    );
    f.watcher.poll_once().await;
    assert_eq!(
        f.store.get_task(&id).await.unwrap().unwrap().status,
        TaskStatus::Paused
    );

    drop_file(
        &f,
        "main",
        "tasks",
        "5.json",
        &format!(r#"{{"type":"cancel_task","taskId":"{id}"}}"#),
    );
    f.watcher.poll_once().await;
    assert!(f.store.get_task(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_schedule_is_rejected_not_quarantined() {
    let f = fixture();
    let path = drop_file(
        &f,
        "family",
        "tasks",
        "1.json",
        r#"{"type":"schedule_task","prompt":"p","scheduleType":"cron","scheduleValue":"every day"}"#,
    );
    f.watcher.poll_once().await;
    assert!(!path.exists());
    assert!(f.store.list_tasks().await.unwrap().is_empty());
    assert!(!quarantined(&f, "family", "1.json"));
}

#[tokio::test]
async fn only_main_registers_groups() {
    let f = fixture();
    drop_file(
        &f,
        "family",
        "tasks",
        "1.json",
        r#"{"type":"register_group","jid":"new@g.us","name":"New","folder":"newbie"}"#,
    );
    f.watcher.poll_once().await;
    assert!(f.state.conversation("new@g.us").is_none());

    drop_file(
        &f,
        "main",
        "tasks",
        "2.json",
        r#"{"type":"register_group","jid":"new@g.us","name":"New","folder":"newbie"}"#,
    );
    f.watcher.poll_once().await;
    let conversation = f.state.conversation("new@g.us").unwrap();
    assert_eq!(conversation.folder, "newbie");
    assert_eq!(conversation.trigger, "@Andy");
    assert!(!conversation.is_main);
}

#[tokio::test]
async fn re_registration_keeps_configured_mounts() {
    let f = fixture();
    let mounts = vec![MountRequest {
        host_path: "~/projects/family".to_string(),
        container_path: Some("projects".to_string()),
        readonly: true,
    }];
    register_group(
        &f.config,
        &f.state,
        GroupRegistration {
            chat_id: "fam@g.us".to_string(),
            folder: "family".to_string(),
            additional_mounts: mounts.clone(),
            ..Default::default()
        },
    )
    .unwrap();

    drop_file(
        &f,
        "main",
        "tasks",
        "1.json",
        r#"{"type":"register_group","jid":"fam@g.us","name":"Family Chat","folder":"family"}"#,
    );
    f.watcher.poll_once().await;
    let conversation = f.state.conversation("fam@g.us").unwrap();
    assert_eq!(conversation.name, "Family Chat");
    assert_eq!(conversation.mount_config.additional_mounts, mounts);
}

#[tokio::test]
async fn refresh_groups_is_main_only() {
    let f = fixture();
    f.bridge
        .groups
        .lock()
        .insert("fam@g.us".to_string(), "Family".to_string());

    drop_file(&f, "family", "tasks", "1.json", r#"{"type":"refresh_groups"}"#);
    f.watcher.poll_once().await;
    assert!(!f.config.ipc_folder_dir("main").join("availableGroups.json").exists());

    drop_file(&f, "main", "tasks", "2.json", r#"{"type":"refreshGroups"}"#);
    f.watcher.poll_once().await;
    let chats = f.store.list_chats().await.unwrap();
    assert_eq!(chats[0].name, "Family");
    assert!(f.config.ipc_folder_dir("main").join("availableGroups.json").exists());
}

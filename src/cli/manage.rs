use anyhow::{Result, bail};
use console::style;

use crate::core::config::KernelConfig;
use crate::core::groups::{GroupRegistration, register_group};
use crate::core::state::KernelState;
use crate::core::store::{MessageStore, TaskStatus};
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

use super::daemon::PID_FILE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RegisterArgs {
    pub chat: Option<String>,
    pub folder: Option<String>,
    pub name: Option<String>,
    pub trigger: Option<String>,
    pub main: bool,
}

pub(crate) fn parse_register_args(args: &[String], start: usize) -> RegisterArgs {
    let mut parsed = RegisterArgs::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--chat" | "-c" => {
                parsed.chat = value;
                i += 2;
            }
            "--folder" | "-f" => {
                parsed.folder = value;
                i += 2;
            }
            "--name" | "-n" => {
                parsed.name = value;
                i += 2;
            }
            "--trigger" | "-t" => {
                parsed.trigger = value;
                i += 2;
            }
            "--main" => {
                parsed.main = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

/// Main status is a property of the folder, so `--main` only picks the main folder.
pub(crate) fn resolve_folder(args: &RegisterArgs, main_folder: &str) -> Result<String> {
    match (&args.folder, args.main) {
        (Some(folder), true) if folder != main_folder => bail!(
            "--main registers into the '{}' folder; drop --folder or use --folder {}",
            main_folder,
            main_folder
        ),
        (Some(folder), _) => Ok(folder.clone()),
        (None, true) => Ok(main_folder.to_string()),
        (None, false) => bail!("--folder is required (or --main)"),
    }
}

pub async fn run_register(config: &KernelConfig, args: &[String]) -> Result<()> {
    let parsed = parse_register_args(args, 2);
    let Some(chat) = parsed.chat.clone() else {
        bail!("--chat is required");
    };
    let folder = resolve_folder(&parsed, &config.main_folder)?;

    let state = KernelState::load(config.state_dir())?;
    let conversation = register_group(
        config,
        &state,
        GroupRegistration {
            chat_id: state.resolve_alias(&chat),
            name: parsed.name.unwrap_or_default(),
            folder,
            trigger: parsed.trigger,
            additional_mounts: Vec::new(),
        },
    )?;

    print_success(&format!(
        "Registered {} as '{}'",
        style(&conversation.chat_id).cyan(),
        conversation.folder
    ));
    GuideSection::new("Conversation")
        .status("Name", &conversation.name)
        .status("Trigger", &conversation.trigger)
        .status("Main", if conversation.is_main { "yes" } else { "no" })
        .print();
    if config.run_dir().join(PID_FILE).exists() {
        print_warn("The gateway is running; restart it to pick up the new conversation.");
    }
    println!();
    Ok(())
}

pub(crate) fn parse_folder_filter(args: &[String], start: usize) -> Option<String> {
    args.iter()
        .skip(start)
        .position(|a| a == "--folder" || a == "-f")
        .and_then(|i| args.get(start + i + 1).cloned())
}

pub async fn run_tasks(config: &KernelConfig, args: &[String]) -> Result<()> {
    let store = MessageStore::open(config.store_path()).await?;
    let tasks = match parse_folder_filter(args, 2) {
        Some(folder) => store.list_tasks_for_folder(&folder).await?,
        None => store.list_tasks().await?,
    };
    if tasks.is_empty() {
        print_info("No scheduled tasks.");
        return Ok(());
    }

    for task in tasks {
        let status = match task.status {
            TaskStatus::Active => style("active").green().to_string(),
            TaskStatus::Paused => style("paused").yellow().to_string(),
            TaskStatus::Completed => style("completed").dim().to_string(),
        };
        GuideSection::new(&task.id)
            .status("Folder", &task.group_folder)
            .status("Schedule", &format!("{} {}", task.schedule_type, task.schedule_value))
            .status("Status", &status)
            .status("Next run", task.next_run.as_deref().unwrap_or("-"))
            .status("Last result", task.last_result.as_deref().unwrap_or("-"))
            .text(&task.prompt)
            .print();
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_args_read_every_flag() {
        let parsed = parse_register_args(
            &args(&[
                "kestrel", "register", "--chat", "fam@g.us", "--folder", "family", "--name",
                "Family", "--trigger", "@Kes",
            ]),
            2,
        );
        assert_eq!(parsed.chat.as_deref(), Some("fam@g.us"));
        assert_eq!(parsed.folder.as_deref(), Some("family"));
        assert_eq!(parsed.name.as_deref(), Some("Family"));
        assert_eq!(parsed.trigger.as_deref(), Some("@Kes"));
        assert!(!parsed.main);
    }

    #[test]
    fn main_flag_selects_the_main_folder() {
        let parsed = parse_register_args(&args(&["kestrel", "register", "--chat", "me@s", "--main"]), 2);
        assert_eq!(resolve_folder(&parsed, "main").unwrap(), "main");

        let clash = RegisterArgs {
            folder: Some("family".to_string()),
            main: true,
            ..Default::default()
        };
        assert!(resolve_folder(&clash, "main").is_err());
        assert!(resolve_folder(&RegisterArgs::default(), "main").is_err());
    }

    #[test]
    fn folder_filter_is_optional() {
        assert_eq!(
            parse_folder_filter(&args(&["kestrel", "tasks", "--folder", "family"]), 2).as_deref(),
            Some("family")
        );
        assert_eq!(parse_folder_filter(&args(&["kestrel", "tasks"]), 2), None);
        assert_eq!(parse_folder_filter(&args(&["kestrel", "tasks", "--folder"]), 2), None);
    }
}

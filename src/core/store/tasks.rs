use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, params};

use super::MessageStore;
use super::types::{ContextMode, RunStatus, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus};

const TASK_COLUMNS: &str = "id, group_folder, chat_id, prompt, schedule_type, schedule_value,
    context_mode, next_run, last_run, last_result, status, created_at";

fn text_col<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::other(format!("unexpected value '{}'", raw))),
        )
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: text_col(row, 4, ScheduleType::parse)?,
        schedule_value: row.get(5)?,
        context_mode: text_col(row, 6, ContextMode::parse)?,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: text_col(row, 10, TaskStatus::parse)?,
        created_at: row.get(11)?,
    })
}

impl MessageStore {
    pub async fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_tasks (id, group_folder, chat_id, prompt, schedule_type,
                schedule_value, context_mode, next_run, last_run, last_result, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.group_folder,
                task.chat_id,
                task.prompt,
                task.schedule_type.as_str(),
                task.schedule_value,
                task.context_mode.as_str(),
                task.next_run,
                task.last_run,
                task.last_result,
                task.status.as_str(),
                task.created_at
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(db.query_row(&sql, params![id], row_to_task).optional()?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM scheduled_tasks ORDER BY created_at, id",
                TASK_COLUMNS
            ),
            &[],
        )
        .await
    }

    pub async fn list_tasks_for_folder(&self, folder: &str) -> Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at, id",
                TASK_COLUMNS
            ),
            &[folder],
        )
        .await
    }

    /// Active tasks whose `next_run` is at or before `now`, earliest first.
    pub async fn get_due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run, id",
                TASK_COLUMNS
            ),
            &[now],
        )
        .await
    }

    async fn query_tasks(&self, sql: &str, bind: &[&str]) -> Result<Vec<ScheduledTask>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bind.iter()), row_to_task)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub async fn set_task_next_run(&self, id: &str, next_run: Option<&str>) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
            params![id, next_run],
        )?;
        Ok(updated > 0)
    }

    /// Rewrites the run bookkeeping of one task row in a single statement.
    pub async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_run: &str,
        last_result: &str,
        status: TaskStatus,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_tasks
             SET next_run = ?2, last_run = ?3, last_result = ?4, status = ?5
             WHERE id = ?1",
            params![id, next_run, last_run, last_result, status.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM task_run_logs WHERE task_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub async fn log_task_run(&self, log: &TaskRunLog) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.task_id,
                log.run_at,
                log.duration_ms,
                log.status.as_str(),
                log.result,
                log.error
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_task_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT task_id, run_at, duration_ms, status, result, error FROM task_run_logs
             WHERE task_id = ?1 ORDER BY run_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit as i64], |row| {
            Ok(TaskRunLog {
                task_id: row.get(0)?,
                run_at: row.get(1)?,
                duration_ms: row.get(2)?,
                status: text_col(row, 3, RunStatus::parse)?,
                result: row.get(4)?,
                error: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    fn task(id: &str, folder: &str, next_run: Option<&str>) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_id: format!("{}@g.us", folder),
            prompt: "check the weather".to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: next_run.map(str::to_string),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn due_tasks_respect_status_and_time() {
        let store = test_store();
        store
            .create_task(&task("t1", "main", Some("2024-01-01T00:00:00.000Z")))
            .await
            .unwrap();
        store
            .create_task(&task("t2", "main", Some("2099-01-01T00:00:00.000Z")))
            .await
            .unwrap();
        store.create_task(&task("t3", "main", None)).await.unwrap();
        store
            .create_task(&task("t4", "main", Some("2024-01-01T00:00:00.000Z")))
            .await
            .unwrap();
        store.set_task_status("t4", TaskStatus::Paused).await.unwrap();

        let due = store.get_due_tasks("2024-06-01T00:00:00.000Z").await.unwrap();
        let ids: Vec<_> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1"]);
    }

    #[tokio::test]
    async fn update_after_run_rewrites_bookkeeping() {
        let store = test_store();
        store
            .create_task(&task("t1", "main", Some("2024-01-01T00:00:00.000Z")))
            .await
            .unwrap();
        assert!(
            store
                .update_task_after_run(
                    "t1",
                    None,
                    "2024-01-01T00:00:05.000Z",
                    "Completed",
                    TaskStatus::Completed,
                )
                .await
                .unwrap()
        );
        let got = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert!(got.next_run.is_none());
        assert_eq!(got.last_result.as_deref(), Some("Completed"));
        assert!(!store
            .update_task_after_run("ghost", None, "x", "y", TaskStatus::Active)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn folder_listing_and_delete_with_logs() {
        let store = test_store();
        store.create_task(&task("t1", "main", None)).await.unwrap();
        store.create_task(&task("t2", "family", None)).await.unwrap();
        store
            .log_task_run(&TaskRunLog {
                task_id: "t2".to_string(),
                run_at: "2024-01-01T00:00:00.000Z".to_string(),
                duration_ms: 1200,
                status: RunStatus::Error,
                result: None,
                error: Some("boom".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(store.list_tasks().await.unwrap().len(), 2);
        let family = store.list_tasks_for_folder("family").await.unwrap();
        assert_eq!(family.len(), 1);
        assert_eq!(store.list_task_runs("t2", 10).await.unwrap().len(), 1);

        assert!(store.delete_task("t2").await.unwrap());
        assert!(!store.delete_task("t2").await.unwrap());
        assert!(store.list_task_runs("t2", 10).await.unwrap().is_empty());
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::entity::{CREATE_INDEXES, CREATE_TASKS, CREATE_TASK_EVENTS, TASK_COLUMNS};
use super::mapping::{progress_to_db, row_to_event, row_to_task, to_db_time};
use super::TaskStore;
use crate::schedule::error::TaskError;
use crate::schedule::types::{
    EventType, StatusCounts, Task, TaskEvent, TaskPatch, TaskQuery, TaskStats, TaskStatus,
};

// optimistic update retries before giving up on a hot row
const MAX_UPDATE_ATTEMPTS: usize = 16;

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn open(database_url: &str) -> Result<Self, TaskError> {
        info!("Initializing SQLite task storage at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // an in-memory database lives and dies with its single connection
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), TaskError> {
        sqlx::query(CREATE_TASKS).execute(&self.pool).await?;
        sqlx::query(CREATE_TASK_EVENTS).execute(&self.pool).await?;
        for index in CREATE_INDEXES {
            sqlx::query(index).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_versioned(&self, task_id: &str) -> Result<(Task, i64), TaskError> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE task_id = ?", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(TaskError::NotFound(task_id.to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) async fn count_events(&self, task_id: &str) -> Result<i64, TaskError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM task_events WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn push_sweep_filter(builder: &mut QueryBuilder<'_, Sqlite>, cutoff: &str, statuses: &[TaskStatus]) {
    builder
        .push("completed_at IS NOT NULL AND completed_at < ")
        .push_bind(cutoff.to_string())
        .push(" AND status IN (");
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: &Task) -> Result<String, TaskError> {
        task.validate()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            TASK_COLUMNS
        ))
        .bind(&task.task_id)
        .bind(&task.video_id)
        .bind(&task.source_url)
        .bind(&task.video_title)
        .bind(task.status.as_str())
        .bind(progress_to_db(&task.progress)?)
        .bind(&task.error_message)
        .bind(to_db_time(&task.created_at))
        .bind(to_db_time(&task.updated_at))
        .bind(task.completed_at.as_ref().map(to_db_time))
        .bind(task.processing_time)
        .bind(task.file_size)
        .bind(task.segments_count)
        .bind(task.transcription_length)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO task_events (task_id, event_type, message, timestamp) VALUES (?, ?, ?, ?)")
            .bind(&task.task_id)
            .bind(EventType::Created.as_str())
            .bind("Task created")
            .bind(to_db_time(&task.created_at))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(task_id = %task.task_id, "task row created");
        Ok(task.task_id.clone())
    }

    async fn get(&self, task_id: &str) -> Result<Task, TaskError> {
        self.fetch_versioned(task_id).await.map(|(task, _)| task)
    }

    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Task, TaskError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let (mut task, version) = self.fetch_versioned(task_id).await?;
            task.apply(patch.clone(), Utc::now())?;

            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET video_title = ?,
                    status = ?,
                    progress = ?,
                    error_message = ?,
                    updated_at = ?,
                    completed_at = ?,
                    processing_time = ?,
                    file_size = ?,
                    segments_count = ?,
                    transcription_length = ?,
                    version = version + 1
                WHERE task_id = ? AND version = ?
                "#,
            )
            .bind(&task.video_title)
            .bind(task.status.as_str())
            .bind(progress_to_db(&task.progress)?)
            .bind(&task.error_message)
            .bind(to_db_time(&task.updated_at))
            .bind(task.completed_at.as_ref().map(to_db_time))
            .bind(task.processing_time)
            .bind(task.file_size)
            .bind(task.segments_count)
            .bind(task.transcription_length)
            .bind(task_id)
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(task);
            }
            debug!(task_id, attempt, "task row changed underneath update, retrying");
            tokio::task::yield_now().await;
        }

        Err(TaskError::Conflict(format!(
            "task {} kept changing during {} update attempts",
            task_id, MAX_UPDATE_ATTEMPTS
        )))
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, TaskError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS));

        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", escape_like(term));
            builder
                .push(" AND (task_id LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR video_id LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR video_title LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        builder
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_task(row).map(|(task, _)| task)).collect()
    }

    async fn append_event(
        &self,
        task_id: &str,
        event_type: EventType,
        message: &str,
    ) -> Result<TaskEvent, TaskError> {
        let timestamp = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO task_events (task_id, event_type, message, timestamp)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM tasks WHERE task_id = ?)
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(event_type.as_str())
        .bind(message)
        .bind(to_db_time(&timestamp))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        Ok(TaskEvent {
            id: row.try_get("id")?,
            task_id: task_id.to_string(),
            event_type,
            message: message.to_string(),
            timestamp,
        })
    }

    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, TaskError> {
        let mut tx = self.pool.begin().await?;
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            tx.rollback().await?;
            return Err(TaskError::NotFound(task_id.to_string()));
        }

        let rows = sqlx::query(
            "SELECT id, task_id, event_type, message, timestamp FROM task_events \
             WHERE task_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_events WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn aggregate_stats(&self, since: DateTime<Utc>) -> Result<TaskStats, TaskError> {
        // a single statement reads a single snapshot
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0) AS queued,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                AVG(CASE WHEN status = 'completed' THEN processing_time END) AS avg_processing_time,
                COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0) AS recent
            FROM tasks
            "#,
        )
        .bind(to_db_time(&since))
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, TaskError> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };
        let avg: Option<f64> = row.try_get("avg_processing_time")?;

        Ok(TaskStats {
            total_tasks: count("total")?,
            status_counts: StatusCounts {
                queued: count("queued")?,
                processing: count("processing")?,
                completed: count("completed")?,
                failed: count("failed")?,
            },
            avg_processing_time: avg.map(|v| (v * 100.0).round() / 100.0).unwrap_or(0.0),
            recent_tasks: count("recent")?,
        })
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<Vec<String>, TaskError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = to_db_time(&cutoff);

        let mut tx = self.pool.begin().await?;

        let mut events: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM task_events WHERE task_id IN (SELECT task_id FROM tasks WHERE ");
        push_sweep_filter(&mut events, &cutoff, statuses);
        events.push(")");
        events.build().execute(&mut *tx).await?;

        let mut tasks: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM tasks WHERE ");
        push_sweep_filter(&mut tasks, &cutoff, statuses);
        tasks.push(" RETURNING task_id");
        let rows = tasks.build().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<String, _>("task_id"))
            .collect::<Result<Vec<_>, _>>()?;
        info!(deleted = ids.len(), "swept old tasks");
        Ok(ids)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

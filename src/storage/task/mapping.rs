use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::schedule::error::TaskError;
use crate::schedule::types::{Progress, Task, TaskEvent};

/// Fixed-width UTC form, so string order in SQL matches time order.
pub fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(value: &str) -> Result<DateTime<Utc>, TaskError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TaskError::Corrupt(format!("bad timestamp {:?}: {}", value, e)))
}

fn from_db_time_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, TaskError> {
    value.as_deref().map(from_db_time).transpose()
}

pub fn progress_to_db(progress: &Progress) -> Result<String, TaskError> {
    serde_json::to_string(progress).map_err(|e| TaskError::Corrupt(e.to_string()))
}

/// Decodes a task row together with its optimistic version.
pub fn row_to_task(row: &SqliteRow) -> Result<(Task, i64), TaskError> {
    let status: String = row.try_get("status")?;
    let progress: String = row.try_get("progress")?;
    let progress: Progress = serde_json::from_str(&progress)
        .map_err(|e| TaskError::Corrupt(format!("bad progress record: {}", e)))?;

    let task = Task {
        task_id: row.try_get("task_id")?,
        video_id: row.try_get("video_id")?,
        source_url: row.try_get("video_url")?,
        video_title: row.try_get("video_title")?,
        status: status.parse().map_err(|_| TaskError::Corrupt(format!("bad status {:?}", status)))?,
        progress,
        error_message: row.try_get("error_message")?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
        completed_at: from_db_time_opt(row.try_get("completed_at")?)?,
        processing_time: row.try_get("processing_time")?,
        file_size: row.try_get("file_size")?,
        segments_count: row.try_get("segments_count")?,
        transcription_length: row.try_get("transcription_length")?,
    };
    let version: i64 = row.try_get("version")?;
    Ok((task, version))
}

pub fn row_to_event(row: &SqliteRow) -> Result<TaskEvent, TaskError> {
    let event_type: String = row.try_get("event_type")?;
    Ok(TaskEvent {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        event_type: event_type.parse()?,
        message: row.try_get("message")?,
        timestamp: from_db_time(&row.try_get::<String, _>("timestamp")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_is_fixed_width_and_ordered() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::microseconds(1500);
        let (a, b) = (to_db_time(&early), to_db_time(&late));
        assert_eq!(a, "2026-01-02T03:04:05.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(from_db_time(&b).unwrap(), late);
    }
}

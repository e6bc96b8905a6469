//! Persisted layout of the task store.

pub const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    video_url TEXT NOT NULL,
    video_title TEXT,
    status TEXT NOT NULL,
    progress TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    processing_time REAL,
    file_size REAL,
    segments_count INTEGER,
    transcription_length INTEGER,
    version INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_TASK_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS task_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks (task_id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp TEXT NOT NULL
)
"#;

pub const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_completed_at ON tasks(status, completed_at)",
    "CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events(task_id, timestamp)",
];

pub const TASK_COLUMNS: &str = "task_id, video_id, video_url, video_title, status, progress, \
    error_message, created_at, updated_at, completed_at, processing_time, file_size, \
    segments_count, transcription_length, version";

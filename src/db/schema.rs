pub const SCHEMA_VERSION: &str = "3";

/// Tables owned by the migration subsystem.
///
/// Form-backed tables are not listed here: they are created by the form builder
/// and only ever altered through the migration engine.
pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);

-- Audit trail. One row per attempted migration, rollback or restore
CREATE TABLE IF NOT EXISTS migration_history (
    history_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id          TEXT NOT NULL,
    field_id         TEXT NOT NULL,
    migration_type   TEXT NOT NULL,
    table_name       TEXT NOT NULL,
    column_name      TEXT NOT NULL,
    new_column_name  TEXT,
    data_type        TEXT,
    old_data_type    TEXT,
    forward_sql      TEXT,
    rollback_sql     TEXT,
    status           INTEGER NOT NULL DEFAULT 0,
    executed_by      TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    executed_at      INTEGER,
    error_message    TEXT,
    backup_id        INTEGER,
    rollback_of      INTEGER,
    FOREIGN KEY (rollback_of) REFERENCES migration_history(history_id)
);

CREATE INDEX IF NOT EXISTS idx_history_form ON migration_history (form_id, history_id);
CREATE INDEX IF NOT EXISTS idx_history_rollback_of ON migration_history (rollback_of);
CREATE INDEX IF NOT EXISTS idx_history_backup ON migration_history (backup_id);

-- Column snapshots taken before destructive operations
CREATE TABLE IF NOT EXISTS data_backups (
    backup_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id          TEXT,
    table_name       TEXT NOT NULL,
    column_name      TEXT NOT NULL,
    value_type       TEXT NOT NULL,
    row_count        INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    retention_until  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backups_form ON data_backups (form_id);

-- Snapshot values keep their SQLite storage class (no declared type, no affinity)
CREATE TABLE IF NOT EXISTS backup_rows (
    backup_id   INTEGER NOT NULL,
    row_id      INTEGER NOT NULL,
    value,
    PRIMARY KEY (backup_id, row_id),
    FOREIGN KEY (backup_id) REFERENCES data_backups(backup_id) ON DELETE CASCADE
) WITHOUT ROWID;

-- Durable job store for the migration queue
CREATE TABLE IF NOT EXISTS migration_jobs (
    job_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id      TEXT NOT NULL,
    history_id   INTEGER NOT NULL,
    change_json  TEXT NOT NULL,
    status       INTEGER NOT NULL DEFAULT 0,
    attempts     INTEGER NOT NULL DEFAULT 0,
    next_run_at  INTEGER NOT NULL,
    last_error   TEXT,
    created_at   INTEGER NOT NULL,
    started_at   INTEGER,
    finished_at  INTEGER,
    FOREIGN KEY (history_id) REFERENCES migration_history(history_id)
);

CREATE INDEX IF NOT EXISTS idx_jobs_form_status ON migration_jobs (form_id, status, job_id);

-- Jobs that exhausted their retries, kept for manual inspection
CREATE TABLE IF NOT EXISTS migration_dead_letters (
    job_id       INTEGER PRIMARY KEY,
    form_id      TEXT NOT NULL,
    history_id   INTEGER NOT NULL,
    change_json  TEXT NOT NULL,
    attempts     INTEGER NOT NULL,
    last_error   TEXT,
    failed_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_form ON migration_dead_letters (form_id);

INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '3');
"#;

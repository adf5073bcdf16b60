use std::collections::HashSet;

use log::warn;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::changes::{ChangeKind, ChangeRecord};
use crate::db::Database;
use crate::error::FormShiftError;

#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued = 0,
    Active = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => JobStatus::Queued,
            1 => JobStatus::Active,
            2 => JobStatus::Completed,
            3 => JobStatus::Failed,
            4 => JobStatus::Cancelled,
            _ => {
                warn!("Invalid JobStatus value in database: {}, treating as Failed", value);
                JobStatus::Failed
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub job_id: i64,
    pub form_id: String,
    pub history_id: i64,
    pub change: ChangeRecord,
    pub status: JobStatus,
    pub attempts: u32,
    /// Milliseconds since the epoch
    pub next_run_at: i64,
    pub last_error: Option<String>,
}

/// Response item for a freshly enqueued job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    pub job_id: i64,
    pub history_id: i64,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job_id: i64,
    pub form_id: String,
    pub history_id: i64,
    pub change: ChangeRecord,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_at: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    /// Failed and cancelled jobs
    pub failed: u64,
}

const JOB_COLUMNS: &str =
    "job_id, form_id, history_id, change_json, status, attempts, next_run_at, last_error";

/// Job store operations over the `migration_jobs` and `migration_dead_letters`
/// tables. Not instantiated; all functions take the connection to work on.
pub struct JobStore;

impl JobStore {
    /// Must be called within a transaction together with the history entry it points at.
    pub fn insert(
        conn: &Connection,
        form_id: &str,
        history_id: i64,
        change: &ChangeRecord,
        now_ms: i64,
    ) -> Result<i64, FormShiftError> {
        conn.execute(
            "INSERT INTO migration_jobs (
                form_id, history_id, change_json, status, attempts, next_run_at, created_at
            ) VALUES (?, ?, ?, ?, 0, ?, ?)",
            params![
                form_id,
                history_id,
                change.to_json()?,
                JobStatus::Queued.as_i64(),
                now_ms,
                now_ms / 1000,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(conn: &Connection, job_id: i64) -> Result<Option<QueueJob>, FormShiftError> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM migration_jobs WHERE job_id = ?", JOB_COLUMNS),
                [job_id],
                Self::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Claim the next runnable job and mark it active.
    ///
    /// A job is runnable when it is queued, due, and is its form's earliest
    /// unfinished job, so a form never has two jobs active and never runs them out
    /// of order. Forms in `busy_forms` are skipped.
    pub fn claim_next(
        conn: &Connection,
        now_ms: i64,
        busy_forms: &HashSet<String>,
    ) -> Result<Option<QueueJob>, FormShiftError> {
        Database::immediate_transaction(conn, |c| {
            let candidates = {
                let mut stmt = c.prepare(&format!(
                    "SELECT {} FROM migration_jobs j
                     WHERE j.status = ?1 AND j.next_run_at <= ?2
                       AND j.job_id = (
                           SELECT MIN(k.job_id) FROM migration_jobs k
                           WHERE k.form_id = j.form_id AND k.status IN (?1, ?3)
                       )
                     ORDER BY j.next_run_at, j.job_id",
                    JOB_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        params![JobStatus::Queued.as_i64(), now_ms, JobStatus::Active.as_i64()],
                        Self::from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let Some(mut job) = candidates
                .into_iter()
                .find(|job| !busy_forms.contains(&job.form_id))
            else {
                return Ok(None);
            };

            c.execute(
                "UPDATE migration_jobs
                 SET status = ?, attempts = attempts + 1, started_at = ?
                 WHERE job_id = ? AND status = ?",
                params![
                    JobStatus::Active.as_i64(),
                    now_ms / 1000,
                    job.job_id,
                    JobStatus::Queued.as_i64(),
                ],
            )?;

            job.status = JobStatus::Active;
            job.attempts += 1;
            Ok(Some(job))
        })
    }

    pub fn complete(conn: &Connection, job_id: i64) -> Result<(), FormShiftError> {
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE migration_jobs SET status = ?, finished_at = ?, last_error = NULL
             WHERE job_id = ? AND status = ?",
            params![
                JobStatus::Completed.as_i64(),
                now,
                job_id,
                JobStatus::Active.as_i64(),
            ],
        )?;
        Ok(())
    }

    pub fn requeue(
        conn: &Connection,
        job_id: i64,
        next_run_at_ms: i64,
        error: &str,
    ) -> Result<(), FormShiftError> {
        conn.execute(
            "UPDATE migration_jobs SET status = ?, next_run_at = ?, last_error = ?
             WHERE job_id = ? AND status = ?",
            params![
                JobStatus::Queued.as_i64(),
                next_run_at_ms,
                error,
                job_id,
                JobStatus::Active.as_i64(),
            ],
        )?;
        Ok(())
    }

    /// Mark the job failed and copy it to the dead-letter table.
    pub fn fail(conn: &Connection, job: &QueueJob, error: &str) -> Result<(), FormShiftError> {
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "UPDATE migration_jobs SET status = ?, finished_at = ?, last_error = ?
             WHERE job_id = ?",
            params![JobStatus::Failed.as_i64(), now, error, job.job_id],
        )?;

        conn.execute(
            "INSERT OR REPLACE INTO migration_dead_letters (
                job_id, form_id, history_id, change_json, attempts, last_error, failed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                job.job_id,
                job.form_id,
                job.history_id,
                job.change.to_json()?,
                job.attempts,
                error,
                now,
            ],
        )?;
        Ok(())
    }

    /// Cancel a job that hasn't started. Returns the cancelled job.
    pub fn cancel(conn: &Connection, job_id: i64) -> Result<QueueJob, FormShiftError> {
        let job = Self::get(conn, job_id)?
            .ok_or_else(|| FormShiftError::NotFound(format!("Job {}", job_id)))?;

        if job.status != JobStatus::Queued {
            return Err(FormShiftError::JobNotCancellable(job_id));
        }

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE migration_jobs SET status = ?, finished_at = ?, last_error = 'cancelled'
             WHERE job_id = ?",
            params![JobStatus::Cancelled.as_i64(), now, job_id],
        )?;

        Ok(QueueJob {
            status: JobStatus::Cancelled,
            ..job
        })
    }

    pub fn status_counts(conn: &Connection, form_id: &str) -> Result<QueueStatus, FormShiftError> {
        let mut stmt = conn.prepare(
            "SELECT status, count(*) FROM migration_jobs WHERE form_id = ? GROUP BY status",
        )?;
        let rows = stmt
            .query_map([form_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut status = QueueStatus::default();
        for (value, count) in rows {
            let count = count.max(0) as u64;
            match JobStatus::from_i64(value) {
                JobStatus::Queued => status.waiting += count,
                JobStatus::Active => status.active += count,
                JobStatus::Completed => status.completed += count,
                JobStatus::Failed | JobStatus::Cancelled => status.failed += count,
            }
        }
        Ok(status)
    }

    pub fn has_unfinished(conn: &Connection, form_id: &str) -> Result<bool, FormShiftError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM migration_jobs WHERE form_id = ? AND status IN (?, ?) LIMIT 1",
                params![form_id, JobStatus::Queued.as_i64(), JobStatus::Active.as_i64()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn dead_letters(conn: &Connection, form_id: &str) -> Result<Vec<DeadLetter>, FormShiftError> {
        let mut stmt = conn.prepare(
            "SELECT job_id, form_id, history_id, change_json, attempts, last_error, failed_at
             FROM migration_dead_letters WHERE form_id = ? ORDER BY job_id",
        )?;
        let letters = stmt
            .query_map([form_id], |row| {
                Ok(DeadLetter {
                    job_id: row.get(0)?,
                    form_id: row.get(1)?,
                    history_id: row.get(2)?,
                    change: parse_change(row, 3)?,
                    attempts: row.get(4)?,
                    last_error: row.get(5)?,
                    failed_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(letters)
    }

    /// Put jobs left active by a previous process back in the queue.
    pub fn recover_interrupted(conn: &Connection, now_ms: i64) -> Result<usize, FormShiftError> {
        let recovered = conn.execute(
            "UPDATE migration_jobs SET status = ?, next_run_at = ? WHERE status = ?",
            params![JobStatus::Queued.as_i64(), now_ms, JobStatus::Active.as_i64()],
        )?;
        Ok(recovered)
    }

    fn from_row(row: &Row) -> rusqlite::Result<QueueJob> {
        Ok(QueueJob {
            job_id: row.get(0)?,
            form_id: row.get(1)?,
            history_id: row.get(2)?,
            change: parse_change(row, 3)?,
            status: JobStatus::from_i64(row.get(4)?),
            attempts: row.get(5)?,
            next_run_at: row.get(6)?,
            last_error: row.get(7)?,
        })
    }
}

fn parse_change(row: &Row, idx: usize) -> rusqlite::Result<ChangeRecord> {
    let json: String = row.get(idx)?;
    serde_json::from_str(&json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_values() {
        assert_eq!(JobStatus::Queued.as_i64(), 0);
        assert_eq!(JobStatus::from_i64(4), JobStatus::Cancelled);
        assert_eq!(JobStatus::from_i64(-1), JobStatus::Failed);
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"queued\"");
    }
}

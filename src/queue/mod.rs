pub mod job;

use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::changes::ChangeRecord;
use crate::db::Database;
use crate::engine::{sql, AppliedMigration, ExecContext, MigrationEngine};
use crate::error::FormShiftError;
use crate::history::{MigrationHistory, NewHistoryEntry};
use crate::identifiers::{validate_identifier, TableMapper};
use crate::inspector::{SchemaInspector, SqliteInspector};

pub use job::{DeadLetter, EnqueuedJob, JobStatus, JobStore, QueueJob, QueueStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Jobs executing at once across all forms
    pub workers: usize,
    /// Retries after the first attempt for retryable failures
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub poll_interval: Duration,
    /// Per-operation timeout for tables below `large_table_rows`
    pub operation_timeout: Duration,
    pub large_table_rows: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(30),
            large_table_rows: 10_000,
        }
    }
}

/// Durable migration queue.
///
/// Jobs live in `migration_jobs`; this handle only adds the dispatcher and the
/// in-memory set of forms that currently have a job executing or are reserved by
/// a rollback. For any form at most one job runs at a time, in enqueue order.
/// Different forms run concurrently up to `workers`.
#[derive(Clone)]
pub struct MigrationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    db: Database,
    engine: Arc<MigrationEngine>,
    tables: Arc<dyn TableMapper>,
    settings: QueueSettings,
    wake: Notify,
    workers: Arc<Semaphore>,
    busy: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl QueueInner {
    fn busy_forms(&self) -> MutexGuard<'_, HashSet<String>> {
        self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive hold on a form; queued jobs for it don't start until dropped.
pub struct FormReservation {
    inner: Arc<QueueInner>,
    form_id: String,
}

impl Drop for FormReservation {
    fn drop(&mut self) {
        self.inner.busy_forms().remove(&self.form_id);
        self.inner.wake.notify_one();
    }
}

impl MigrationQueue {
    pub fn new(
        db: Database,
        engine: Arc<MigrationEngine>,
        tables: Arc<dyn TableMapper>,
        settings: QueueSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            inner: Arc::new(QueueInner {
                db,
                engine,
                tables,
                settings: QueueSettings { workers, ..settings },
                wake: Notify::new(),
                workers: Arc::new(Semaphore::new(workers)),
                busy: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn table_for_form(&self, form_id: &str) -> String {
        self.inner.tables.table_for_form(form_id)
    }

    pub fn enqueue(
        &self,
        form_id: &str,
        change: &ChangeRecord,
        executed_by: &str,
    ) -> Result<EnqueuedJob, FormShiftError> {
        self.enqueue_batch(form_id, std::slice::from_ref(change), executed_by)?
            .into_iter()
            .next()
            .ok_or_else(|| FormShiftError::Error("Enqueue produced no job".to_string()))
    }

    /// Durably queue `changes` in order. Either all of them are queued or none.
    /// Returns as soon as the jobs are recorded.
    pub fn enqueue_batch(
        &self,
        form_id: &str,
        changes: &[ChangeRecord],
        executed_by: &str,
    ) -> Result<Vec<EnqueuedJob>, FormShiftError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FormShiftError::ShuttingDown);
        }
        for change in changes {
            change.validate()?;
            if change.form_id != form_id {
                return Err(FormShiftError::InvalidInput(format!(
                    "Change for form '{}' submitted under form '{}'",
                    change.form_id, form_id
                )));
            }
        }

        let table = self.table_for_form(form_id);
        validate_identifier(&table)?;

        let conn = self.inner.db.get_connection()?;
        let now = now_ms();

        let jobs = Database::immediate_transaction(&conn, |c| {
            changes
                .iter()
                .map(|change| {
                    let entry = NewHistoryEntry::for_change(
                        change,
                        &table,
                        sql::planned(&table, change),
                        executed_by,
                    );
                    let history_id = MigrationHistory::create_pending(c, &entry)?;
                    let job_id = JobStore::insert(c, form_id, history_id, change, now)?;
                    Ok(EnqueuedJob {
                        job_id,
                        history_id,
                        kind: change.kind,
                        status: JobStatus::Queued,
                    })
                })
                .collect::<Result<Vec<_>, FormShiftError>>()
        })?;

        info!("Queued {} migration(s) for form '{}'", jobs.len(), form_id);
        self.inner.wake.notify_one();
        Ok(jobs)
    }

    pub fn status(&self, form_id: &str) -> Result<QueueStatus, FormShiftError> {
        let conn = self.inner.db.get_connection()?;
        JobStore::status_counts(&conn, form_id)
    }

    /// Cancel a job that hasn't started. Its history entry fails with "cancelled";
    /// the schema is not touched.
    pub fn cancel(&self, job_id: i64) -> Result<QueueJob, FormShiftError> {
        let conn = self.inner.db.get_connection()?;
        let job = Database::immediate_transaction(&conn, |c| {
            let job = JobStore::cancel(c, job_id)?;
            MigrationHistory::mark_failed(c, job.history_id, "cancelled")?;
            Ok(job)
        })?;

        info!("Cancelled job {} for form '{}'", job.job_id, job.form_id);
        Ok(job)
    }

    pub fn dead_letters(&self, form_id: &str) -> Result<Vec<DeadLetter>, FormShiftError> {
        let conn = self.inner.db.get_connection()?;
        JobStore::dead_letters(&conn, form_id)
    }

    /// Take the form's exclusivity slot outside the queue (rollback, restore).
    /// Fails with `FormBusy` while the form has queued or running jobs.
    pub fn reserve_form(&self, form_id: &str) -> Result<FormReservation, FormShiftError> {
        // Connection before lock, the same order as `claim_next`
        let conn = self.inner.db.get_connection()?;

        let mut busy = self.inner.busy_forms();
        if busy.contains(form_id) {
            return Err(FormShiftError::FormBusy(form_id.to_string()));
        }
        if JobStore::has_unfinished(&conn, form_id)? {
            return Err(FormShiftError::FormBusy(form_id.to_string()));
        }

        busy.insert(form_id.to_string());
        Ok(FormReservation {
            inner: Arc::clone(&self.inner),
            form_id: form_id.to_string(),
        })
    }

    pub fn recover_interrupted(&self) -> Result<usize, FormShiftError> {
        let conn = self.inner.db.get_connection()?;
        let recovered = JobStore::recover_interrupted(&conn, now_ms())?;
        if recovered > 0 {
            warn!("Re-queued {} migration job(s) interrupted by a previous shutdown", recovered);
        }
        Ok(recovered)
    }

    /// Recover interrupted jobs and start the dispatcher on the current runtime.
    pub fn start(&self) -> Result<JoinHandle<()>, FormShiftError> {
        self.recover_interrupted()?;
        let queue = self.clone();
        Ok(tokio::spawn(async move { queue.dispatch().await }))
    }

    /// Stop claiming jobs and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        info!("Waiting for in-flight migrations to finish...");

        match self
            .inner
            .workers
            .acquire_many(self.inner.settings.workers as u32)
            .await
        {
            Ok(_all) => info!("Migration workers stopped"),
            Err(e) => warn!("Worker pool closed during shutdown: {}", e),
        }
    }

    async fn dispatch(self) {
        info!(
            "Migration dispatcher started with {} worker(s)",
            self.inner.settings.workers
        );

        while !self.inner.shutdown.is_cancelled() {
            self.fill_workers().await;

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(self.inner.settings.poll_interval) => {}
            }
        }

        info!("Migration dispatcher stopped");
    }

    /// Claim jobs while there are free workers and runnable jobs.
    async fn fill_workers(&self) {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            let Ok(permit) = Arc::clone(&self.inner.workers).try_acquire_owned() else {
                return;
            };

            let queue = self.clone();
            match tokio::task::spawn_blocking(move || queue.claim_next()).await {
                Ok(Ok(Some(job))) => self.spawn_worker(job, permit),
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    error!("Failed to claim the next migration job: {}", e);
                    return;
                }
                Err(e) => {
                    error!("Migration claim task failed: {}", e);
                    return;
                }
            }
        }
    }

    fn claim_next(&self) -> Result<Option<QueueJob>, FormShiftError> {
        let _tmr = timer!(Level::Trace; "MigrationQueue::claim_next");
        let conn = self.inner.db.get_connection()?;

        // Held across the claim so a reservation can't slip in between
        let mut busy = self.inner.busy_forms();
        let job = JobStore::claim_next(&conn, now_ms(), &busy)?;
        if let Some(job) = &job {
            busy.insert(job.form_id.clone());
        }
        Ok(job)
    }

    fn spawn_worker(&self, job: QueueJob, permit: OwnedSemaphorePermit) {
        let queue = self.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;

            if let Err(e) = queue.run_job(&job) {
                error!(
                    "Could not record the outcome of job {} for form '{}': {}",
                    job.job_id, job.form_id, e
                );
            }

            queue.inner.busy_forms().remove(&job.form_id);
            queue.inner.wake.notify_one();
        });
    }

    /// Execute one claimed job and record its outcome.
    fn run_job(&self, job: &QueueJob) -> Result<(), FormShiftError> {
        let _tmr = timer!(Level::Debug; "MigrationQueue::run_job", "{}", job.job_id);
        let conn = self.inner.db.get_connection()?;
        let table = self.table_for_form(&job.form_id);
        let timeout = self.operation_timeout(&conn, &table);

        debug!(
            "Running job {} ({} on {}.{}), attempt {}, timeout {:?}",
            job.job_id, job.change.kind, table, job.change.column_name, job.attempts, timeout
        );

        match self.attempt(&conn, job, &table, timeout) {
            Ok(applied) => {
                info!(
                    "Job {} for form '{}' succeeded{}",
                    job.job_id,
                    job.form_id,
                    if applied.already_applied { " (already applied)" } else { "" }
                );
                Ok(())
            }
            Err(e) => self.handle_failure(&conn, job, e),
        }
    }

    fn attempt(
        &self,
        conn: &Connection,
        job: &QueueJob,
        table: &str,
        timeout: Duration,
    ) -> Result<AppliedMigration, FormShiftError> {
        MigrationHistory::mark_running(conn, job.history_id)?;

        let deadline = Deadline::start(conn, timeout);
        let result = Database::immediate_transaction(conn, |c| {
            let ctx = ExecContext {
                form_id: Some(&job.form_id),
                history_id: Some(job.history_id),
            };
            let applied = self.inner.engine.execute(c, ctx, table, &job.change)?;
            JobStore::complete(c, job.job_id)?;
            Ok(applied)
        });
        let expired = deadline.finish();

        match result {
            Err(e) if expired || e.is_interrupt() => Err(FormShiftError::QueueJobTimeout {
                job_id: job.job_id,
                timeout_secs: timeout.as_secs(),
            }),
            other => other,
        }
    }

    fn handle_failure(
        &self,
        conn: &Connection,
        job: &QueueJob,
        err: FormShiftError,
    ) -> Result<(), FormShiftError> {
        let message = err.to_string();
        let settings = &self.inner.settings;

        if err.is_retryable() && job.attempts <= settings.max_retries {
            let delay = retry_delay(settings.retry_base_delay, settings.retry_max_delay, job.attempts);
            let next_run_at = now_ms() + delay.as_millis() as i64;

            Database::immediate_transaction(conn, |c| {
                JobStore::requeue(c, job.job_id, next_run_at, &message)?;
                if let Err(e) = MigrationHistory::record_attempt_error(c, job.history_id, &message) {
                    warn!("Could not note the failed attempt on history {}: {}", job.history_id, e);
                }
                Ok(())
            })?;

            warn!(
                "Job {} for form '{}' failed on attempt {}, retrying in {:?}: {}",
                job.job_id, job.form_id, job.attempts, delay, message
            );
        } else {
            Database::immediate_transaction(conn, |c| {
                JobStore::fail(c, job, &message)?;
                if let Err(e) = MigrationHistory::mark_failed(c, job.history_id, &message) {
                    warn!("Could not mark history {} failed: {}", job.history_id, e);
                }
                Ok(())
            })?;

            error!(
                "Job {} for form '{}' failed after {} attempt(s) and was moved to dead letters: {}",
                job.job_id, job.form_id, job.attempts, message
            );
        }

        Ok(())
    }

    fn operation_timeout(&self, conn: &Connection, table: &str) -> Duration {
        let rows = SqliteInspector::new(conn).row_count(table).unwrap_or(0);
        scaled_timeout(
            self.inner.settings.operation_timeout,
            rows,
            self.inner.settings.large_table_rows,
        )
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
pub(crate) fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// The base timeout, extended by one base period per `large_table_rows` rows.
pub(crate) fn scaled_timeout(base: Duration, rows: u64, large_table_rows: u64) -> Duration {
    let factor = 1 + rows / large_table_rows.max(1);
    base.saturating_mul(factor.min(u32::MAX as u64) as u32)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Watchdog that interrupts whatever the connection is running once the timeout
/// passes.
struct Deadline {
    stop: Option<mpsc::Sender<()>>,
    watchdog: Option<thread::JoinHandle<bool>>,
}

impl Deadline {
    fn start(conn: &Connection, timeout: Duration) -> Self {
        let interrupt = conn.get_interrupt_handle();
        let (stop, stopped) = mpsc::channel::<()>();

        let watchdog = thread::spawn(move || match stopped.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                interrupt.interrupt();
                true
            }
            _ => false,
        });

        Self {
            stop: Some(stop),
            watchdog: Some(watchdog),
        }
    }

    /// Stop the watchdog. True if it fired.
    fn finish(mut self) -> bool {
        self.stop_watchdog()
    }

    fn stop_watchdog(&mut self) -> bool {
        drop(self.stop.take());
        self.watchdog
            .take()
            .map(|watchdog| watchdog.join().unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

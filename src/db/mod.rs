pub mod schema;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::FormShiftError;
use schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to the SQLite database holding both the subsystem's own tables and the
/// form-backed tables it migrates. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(db_path: &Path, settings: &DatabaseSettings) -> Result<Self, FormShiftError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = settings.busy_timeout;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            c.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(settings.pool_size.max(2))
            .build(manager)?;

        let db = Self { pool };
        {
            let conn = db.get_connection()?;
            Self::ensure_schema(&conn)?;
        }

        info!("Database opened at: {}", db_path.display());
        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, FormShiftError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), FormShiftError> {
        let meta_exists: bool = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;

        if !meta_exists {
            info!("Creating migration subsystem schema (version {})", SCHEMA_VERSION);
            return Self::immediate_transaction(conn, |c| {
                c.execute_batch(CREATE_SCHEMA_SQL)?;
                Ok(())
            });
        }

        let stored_version = Self::get_meta_value_locked(conn, "schema_version")?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(FormShiftError::Error(format!(
                "Schema version mismatch: database is at '{}', expected '{}'",
                other, SCHEMA_VERSION
            ))),
            None => Err(FormShiftError::Error("Schema version missing".to_string())),
        }
    }

    /// Run `f` inside one transaction scope on `conn`.
    ///
    /// In autocommit mode this is a `BEGIN IMMEDIATE` transaction, so the write lock is
    /// taken up front. If a transaction is already open on the connection, a savepoint
    /// is used instead and the work commits or rolls back with the outer scope.
    /// The scope is always closed: committed when `f` returns Ok, rolled back when it
    /// returns Err or panics.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, FormShiftError>
    where
        F: FnOnce(&Connection) -> Result<T, FormShiftError>,
    {
        let scope = TxScope::begin(conn)?;
        let value = f(conn)?;
        scope.commit()?;
        Ok(value)
    }

    pub fn get_meta_value_locked(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<String>, FormShiftError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }
}

/// One open transaction or savepoint. Rolled back on drop unless committed.
struct TxScope<'c> {
    conn: &'c Connection,
    savepoint: Option<String>,
    open: bool,
}

impl<'c> TxScope<'c> {
    fn begin(conn: &'c Connection) -> Result<Self, FormShiftError> {
        let savepoint = if conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            None
        } else {
            let name = format!("fs_sp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
            conn.execute_batch(&format!("SAVEPOINT {}", name))?;
            Some(name)
        };

        Ok(Self {
            conn,
            savepoint,
            open: true,
        })
    }

    /// A failed COMMIT leaves the scope open, so dropping it rolls back.
    fn commit(mut self) -> Result<(), FormShiftError> {
        let result = match &self.savepoint {
            Some(name) => self.conn.execute_batch(&format!("RELEASE {}", name)),
            None => self.conn.execute_batch("COMMIT"),
        };
        result.map_err(|e| FormShiftError::TransactionAborted(format!("Commit failed: {}", e)))?;
        self.open = false;
        Ok(())
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        let result = match &self.savepoint {
            Some(name) => self
                .conn
                .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};")),
            None => {
                if self.conn.is_autocommit() {
                    // SQLite already rolled the transaction back (e.g. after SQLITE_FULL)
                    warn!("Transaction was already closed by SQLite before rollback");
                    Ok(())
                } else {
                    self.conn.execute_batch("ROLLBACK")
                }
            }
        };

        if let Err(e) = result {
            error!("Failed to roll back transaction: {}", e);
        }
    }
}

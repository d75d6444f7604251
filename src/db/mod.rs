//! SQLite-backed persistence for invoices, reminders, the action ledger,
//! and usage metering.
//!
//! The database lives at `~/.dunner/dunner.db` and is the durable system of
//! record. WAL mode is enabled for concurrent reads; all multi-statement
//! writes go through `with_transaction` so a crash mid-batch never leaves a
//! half-applied invoice.

use std::path::PathBuf;

use rusqlite::Connection;
use thiserror::Error;

pub mod types;
pub use types::*;

pub mod invoices;
pub mod ledger;
pub mod reminders;
pub mod usage;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// SQLite connection wrapper for invoice/reminder/ledger state.
///
/// Intentionally NOT `Clone` or `Sync`. It is held behind a
/// `parking_lot::Mutex` in `EngineState`; the lock is never held across a
/// collaborator channel await.
pub struct InvoiceDb {
    conn: Connection,
}

impl InvoiceDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.dunner/dunner.db` and run migrations.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.dunner/dunner.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".dunner").join("dunner.db"))
    }

    /// Distinct tenant ids with at least one invoice, for scheduler fan-out.
    pub fn list_tenants(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT tenant_id FROM invoices ORDER BY tenant_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(row?);
        }
        Ok(tenants)
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use super::InvoiceDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the
    /// test; test temp dirs are cleaned up by the OS. FK enforcement is
    /// disabled so unit tests can insert rows without satisfying every
    /// foreign key constraint.
    pub fn test_db() -> InvoiceDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        let db = InvoiceDb::open_at(path).expect("Failed to open test database");
        db.conn_ref()
            .execute_batch("PRAGMA foreign_keys = OFF;")
            .expect("disable FK for tests");
        db
    }
}

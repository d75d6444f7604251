//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//! A hot backup is taken via the SQLite online backup API before any pending
//! migration is applied.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Only called when there are pending migrations.
fn backup_before_migration(conn: &Connection) -> Result<(), String> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to get database path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        // In-memory or temp database — skip backup
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = rusqlite::Connection::open(&backup_path)
        .map_err(|e| format!("Failed to open backup file: {}", e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("Failed to initialize pre-migration backup: {}", e))?;

    backup
        .step(-1)
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
///
/// Forward-compat guard: if the database has a higher version than the highest
/// known migration, returns an error telling the user to update dunner.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    // Forward-compat guard
    if current > max_known {
        return Err(format!(
            "Database schema version {} is newer than this build supports ({}). Update dunner.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    let mut applied = 0;
    for migration in pending {
        conn.execute_batch("BEGIN")
            .map_err(|e| format!("Failed to begin migration transaction: {}", e))?;

        let result = conn
            .execute_batch(migration.sql)
            .and_then(|_| {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [migration.version],
                )
                .map(|_| ())
            });

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| format!("Failed to commit migration {}: {}", migration.version, e))?;
                log::info!("Applied migration v{}", migration.version);
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(format!("Migration v{} failed: {}", migration.version, e));
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = Connection::open_in_memory().expect("open");
        let applied = run_migrations(&conn).expect("migrate");
        assert_eq!(applied, 1);
        assert_eq!(current_version(&conn).unwrap(), 1);

        // Baseline tables exist
        for table in [
            "invoices",
            "invoice_reminders",
            "invoice_actions",
            "usage_events",
            "usage_counters",
        ] {
            let exists: bool = conn
                .prepare(&format!("SELECT 1 FROM {} LIMIT 1", table))
                .and_then(|mut stmt| stmt.exists([]))
                .is_ok();
            assert!(exists, "table {} should exist", table);
        }
    }

    #[test]
    fn test_rerun_is_noop() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&conn).expect("first"), 1);
        assert_eq!(run_migrations(&conn).expect("second"), 0);
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("migrate");
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .expect("fake future version");
        let result = run_migrations(&conn);
        assert!(result.is_err());
    }
}

//! Idempotent usage metering.
//!
//! A usage event carries a caller-supplied idempotency key; the rolling
//! counter per (tenant, category, period) is incremented exactly once per
//! unique key. Replays under at-least-once delivery are silent no-ops.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;

impl InvoiceDb {
    // =========================================================================
    // Usage events / counters
    // =========================================================================

    /// Record a usage event and bump the current-period counter, exactly
    /// once per unique idempotency key. Returns true when the event was
    /// newly counted, false on replay.
    pub fn record_usage(
        &self,
        tenant_id: &str,
        category: &str,
        idempotency_key: &str,
    ) -> Result<bool, DbError> {
        let period = Utc::now().format("%Y-%m").to_string();
        self.record_usage_in_period(tenant_id, category, idempotency_key, &period)
    }

    /// Period-explicit variant, used directly by tests.
    pub fn record_usage_in_period(
        &self,
        tenant_id: &str,
        category: &str,
        idempotency_key: &str,
        period: &str,
    ) -> Result<bool, DbError> {
        self.with_transaction(|db| {
            let inserted = db.conn_ref().execute(
                "INSERT INTO usage_events (id, tenant_id, category, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(tenant_id, category, idempotency_key) DO NOTHING",
                params![
                    format!("use-{}", Uuid::new_v4()),
                    tenant_id,
                    category,
                    idempotency_key,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            if inserted == 0 {
                // Duplicate key — replay, not an error
                return Ok(false);
            }

            db.conn_ref().execute(
                "INSERT INTO usage_counters (tenant_id, category, period, count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(tenant_id, category, period)
                 DO UPDATE SET count = count + 1",
                params![tenant_id, category, period],
            )?;
            Ok(true)
        })
    }

    /// Current counter value for a (tenant, category, period), 0 if absent.
    pub fn get_usage(
        &self,
        tenant_id: &str,
        category: &str,
        period: &str,
    ) -> Result<i64, DbError> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT count FROM usage_counters
                 WHERE tenant_id = ?1 AND category = ?2 AND period = ?3",
                params![tenant_id, category, period],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }
}

//! The append-only audit ledger.
//!
//! One row per meaningful transition, attributed to an actor ("agent",
//! "system", or a user identity). Rows are never updated or deleted —
//! attempted-but-failed side effects are recorded too, with the failure
//! captured in `details`, so the ledger always reflects what was tried.

use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value};
use uuid::Uuid;

use super::*;

// Known action vocabulary. The column is free-form TEXT; these are the
// values the engine itself writes.
pub const ACTION_DETECTED: &str = "detected";
pub const ACTION_CONFIRMED: &str = "confirmed";
pub const ACTION_REMINDER_SCHEDULED: &str = "reminder_scheduled";
pub const ACTION_REMINDER_DRAFTED: &str = "reminder_drafted";
pub const ACTION_APPROVAL_REQUESTED: &str = "approval_requested";
pub const ACTION_REMINDER_SENT: &str = "reminder_sent";
pub const ACTION_REMINDER_SKIPPED: &str = "reminder_skipped";
pub const ACTION_REMINDER_REJECTED: &str = "reminder_rejected";
pub const ACTION_ESCALATED: &str = "escalated";
pub const ACTION_MARKED_PAID: &str = "marked_paid";
pub const ACTION_REJECTED: &str = "rejected";

/// Actor for autonomous engine decisions.
pub const ACTOR_AGENT: &str = "agent";
/// Actor for housekeeping the engine performs on its own schedule.
pub const ACTOR_SYSTEM: &str = "system";

/// A ledger entry to append.
#[derive(Debug, Clone)]
pub struct NewAction<'a> {
    pub tenant_id: &'a str,
    pub invoice_id: &'a str,
    pub run_id: Option<&'a str>,
    pub action_type: &'a str,
    pub actor: &'a str,
    pub details: Option<serde_json::Value>,
    pub confidence: Option<f64>,
}

/// Filters for querying the ledger.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub tenant_id: Option<String>,
    pub invoice_id: Option<String>,
    pub action_type: Option<String>,
    pub actor: Option<String>,
    /// Shorthand for `action_type = "escalated"`.
    pub escalated_only: bool,
    pub confidence_floor: Option<f64>,
    /// Inclusive RFC 3339 lower bound on created_at.
    pub since: Option<String>,
    /// Exclusive RFC 3339 upper bound on created_at.
    pub until: Option<String>,
    /// Free-text LIKE match over action_type and details.
    pub search: Option<String>,
    pub limit: usize,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
}

/// One page of ledger entries, newest first.
#[derive(Debug)]
pub struct ActionPage {
    pub actions: Vec<DbInvoiceAction>,
    /// Pass back as `ActionFilter::cursor` to fetch the next page.
    pub next_cursor: Option<String>,
}

const DEFAULT_PAGE_SIZE: usize = 50;

impl InvoiceDb {
    // =========================================================================
    // Action ledger
    // =========================================================================

    /// Append a ledger entry. Returns the generated action id.
    pub fn append_action(&self, action: &NewAction<'_>) -> Result<String, DbError> {
        let id = format!("act-{}", Uuid::new_v4());
        let now = Utc::now().to_rfc3339();
        let details = action.details.as_ref().map(|d| d.to_string());
        self.conn.execute(
            "INSERT INTO invoice_actions (
                id, tenant_id, invoice_id, run_id, action_type, actor,
                details, confidence, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                action.tenant_id,
                action.invoice_id,
                action.run_id,
                action.action_type,
                action.actor,
                details,
                action.confidence,
                now,
            ],
        )?;
        Ok(id)
    }

    /// Query the ledger with filters and keyset pagination on
    /// (created_at, id) descending.
    pub fn query_actions(&self, filter: &ActionFilter) -> Result<ActionPage, DbError> {
        let mut sql = String::from(
            "SELECT id, tenant_id, invoice_id, run_id, action_type, actor,
                    details, confidence, created_at
             FROM invoice_actions
             WHERE 1=1",
        );
        let mut values: Vec<Value> = Vec::new();

        let mut push = |sql: &mut String, clause: &str, value: Value| {
            values.push(value);
            sql.push_str(&clause.replace('?', &format!("?{}", values.len())));
        };

        if let Some(ref tenant) = filter.tenant_id {
            push(&mut sql, " AND tenant_id = ?", Value::from(tenant.clone()));
        }
        if let Some(ref invoice) = filter.invoice_id {
            push(&mut sql, " AND invoice_id = ?", Value::from(invoice.clone()));
        }
        if filter.escalated_only {
            sql.push_str(" AND action_type = 'escalated'");
        } else if let Some(ref action_type) = filter.action_type {
            push(&mut sql, " AND action_type = ?", Value::from(action_type.clone()));
        }
        if let Some(ref actor) = filter.actor {
            push(&mut sql, " AND actor = ?", Value::from(actor.clone()));
        }
        if let Some(floor) = filter.confidence_floor {
            push(&mut sql, " AND confidence >= ?", Value::from(floor));
        }
        if let Some(ref since) = filter.since {
            push(&mut sql, " AND created_at >= ?", Value::from(since.clone()));
        }
        if let Some(ref until) = filter.until {
            push(&mut sql, " AND created_at < ?", Value::from(until.clone()));
        }
        if let Some(ref term) = filter.search {
            let pattern = format!("%{}%", term.replace('%', ""));
            values.push(Value::from(pattern.clone()));
            let idx = values.len();
            values.push(Value::from(pattern));
            sql.push_str(&format!(
                " AND (action_type LIKE ?{} OR details LIKE ?{})",
                idx,
                idx + 1
            ));
        }
        if let Some(ref cursor) = filter.cursor {
            if let Some((at, id)) = cursor.split_once('|') {
                values.push(Value::from(at.to_string()));
                let at_idx = values.len();
                values.push(Value::from(at.to_string()));
                values.push(Value::from(id.to_string()));
                sql.push_str(&format!(
                    " AND (created_at < ?{} OR (created_at = ?{} AND id < ?{}))",
                    at_idx,
                    at_idx + 1,
                    at_idx + 2
                ));
            }
        }

        let limit = if filter.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            filter.limit
        };
        // Fetch one extra row to learn whether another page exists
        values.push(Value::from((limit + 1) as i64));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT ?{}",
            values.len()
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_action_row)?;

        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }

        let next_cursor = if actions.len() > limit {
            actions.truncate(limit);
            actions
                .last()
                .map(|a| format!("{}|{}", a.created_at, a.id))
        } else {
            None
        };

        Ok(ActionPage {
            actions,
            next_cursor,
        })
    }

    /// Whether a delivered escalation with this fingerprint exists within
    /// the mute window. Entries whose details carry `"failed":true` do not
    /// count — a failed notification is retried on the next cycle.
    pub fn has_recent_escalation(
        &self,
        invoice_id: &str,
        fingerprint: &str,
        mute_days: u32,
    ) -> Result<bool, DbError> {
        let window = format!("-{} days", mute_days);
        let exists = self
            .conn
            .prepare(
                "SELECT 1 FROM invoice_actions
                 WHERE invoice_id = ?1
                   AND action_type = 'escalated'
                   AND details LIKE ?2
                   AND details NOT LIKE '%\"failed\":true%'
                   AND created_at >= strftime('%Y-%m-%dT%H:%M:%S', 'now', ?3)",
            )?
            .exists(params![invoice_id, format!("%{}%", fingerprint), window])?;
        Ok(exists)
    }

    /// Helper: map a row to `DbInvoiceAction`.
    pub(crate) fn map_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbInvoiceAction> {
        Ok(DbInvoiceAction {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            invoice_id: row.get(2)?,
            run_id: row.get(3)?,
            action_type: row.get(4)?,
            actor: row.get(5)?,
            details: row.get(6)?,
            confidence: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn append(db: &InvoiceDb, invoice: &str, action_type: &str, actor: &str) -> String {
        db.append_action(&NewAction {
            tenant_id: "t1",
            invoice_id: invoice,
            run_id: None,
            action_type,
            actor,
            details: Some(serde_json::json!({"note": format!("{} on {}", action_type, invoice)})),
            confidence: None,
        })
        .expect("append")
    }

    #[test]
    fn test_append_and_query_by_invoice() {
        let db = test_db();
        append(&db, "inv-1", ACTION_DETECTED, ACTOR_AGENT);
        append(&db, "inv-1", ACTION_REMINDER_SENT, "ana@tenant.test");
        append(&db, "inv-2", ACTION_DETECTED, ACTOR_AGENT);

        let page = db
            .query_actions(&ActionFilter {
                invoice_id: Some("inv-1".to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.actions.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_filter_by_actor_and_type() {
        let db = test_db();
        append(&db, "inv-1", ACTION_DETECTED, ACTOR_AGENT);
        append(&db, "inv-1", ACTION_REMINDER_SENT, "ana@tenant.test");

        let page = db
            .query_actions(&ActionFilter {
                tenant_id: Some("t1".to_string()),
                actor: Some(ACTOR_AGENT.to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.actions.len(), 1);
        assert_eq!(page.actions[0].action_type, ACTION_DETECTED);

        let page = db
            .query_actions(&ActionFilter {
                action_type: Some(ACTION_REMINDER_SENT.to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.actions.len(), 1);
    }

    #[test]
    fn test_escalated_only_filter() {
        let db = test_db();
        append(&db, "inv-1", ACTION_DETECTED, ACTOR_AGENT);
        append(&db, "inv-1", ACTION_ESCALATED, ACTOR_AGENT);

        let page = db
            .query_actions(&ActionFilter {
                escalated_only: true,
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.actions.len(), 1);
        assert_eq!(page.actions[0].action_type, ACTION_ESCALATED);
    }

    #[test]
    fn test_free_text_search() {
        let db = test_db();
        db.append_action(&NewAction {
            tenant_id: "t1",
            invoice_id: "inv-1",
            run_id: None,
            action_type: ACTION_REJECTED,
            actor: "ana@tenant.test",
            details: Some(serde_json::json!({"reason": "duplicate of INV-007"})),
            confidence: None,
        })
        .unwrap();
        append(&db, "inv-1", ACTION_DETECTED, ACTOR_AGENT);

        let page = db
            .query_actions(&ActionFilter {
                search: Some("INV-007".to_string()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(page.actions.len(), 1);
        assert_eq!(page.actions[0].action_type, ACTION_REJECTED);
    }

    #[test]
    fn test_cursor_pagination_walks_all_rows() {
        let db = test_db();
        for i in 0..7 {
            append(&db, &format!("inv-{}", i), ACTION_DETECTED, ACTOR_AGENT);
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = db
                .query_actions(&ActionFilter {
                    limit: 3,
                    cursor: cursor.clone(),
                    ..Default::default()
                })
                .expect("query");
            seen.extend(page.actions.iter().map(|a| a.id.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 7, "no row repeats across pages");
    }

    #[test]
    fn test_recent_escalation_ignores_failed_attempts() {
        let db = test_db();
        db.append_action(&NewAction {
            tenant_id: "t1",
            invoice_id: "inv-1",
            run_id: None,
            action_type: ACTION_ESCALATED,
            actor: ACTOR_AGENT,
            details: Some(serde_json::json!({"fingerprint": "abc123", "failed": true})),
            confidence: None,
        })
        .unwrap();
        assert!(!db.has_recent_escalation("inv-1", "abc123", 7).unwrap());

        db.append_action(&NewAction {
            tenant_id: "t1",
            invoice_id: "inv-1",
            run_id: None,
            action_type: ACTION_ESCALATED,
            actor: ACTOR_AGENT,
            details: Some(serde_json::json!({"fingerprint": "abc123"})),
            confidence: None,
        })
        .unwrap();
        assert!(db.has_recent_escalation("inv-1", "abc123", 7).unwrap());
    }

    fn backdated_escalation(db: &InvoiceDb, invoice: &str, fingerprint: &str, hours_ago: i64) {
        let at = (Utc::now() - chrono::Duration::hours(hours_ago)).to_rfc3339();
        db.conn_ref()
            .execute(
                "INSERT INTO invoice_actions
                    (id, tenant_id, invoice_id, action_type, actor, details, created_at)
                 VALUES (?1, 't1', ?2, 'escalated', 'agent', ?3, ?4)",
                params![
                    format!("act-{}", Uuid::new_v4()),
                    invoice,
                    serde_json::json!({"fingerprint": fingerprint}).to_string(),
                    at
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_mute_window_compares_to_the_hour() {
        let db = test_db();
        // One hour past a 7-day window: no longer recent, whatever the
        // calendar day boundary falls on
        backdated_escalation(&db, "inv-1", "fp-old", 7 * 24 + 1);
        assert!(!db.has_recent_escalation("inv-1", "fp-old", 7).unwrap());

        // One hour inside the window: still muted
        backdated_escalation(&db, "inv-2", "fp-new", 7 * 24 - 1);
        assert!(db.has_recent_escalation("inv-2", "fp-new", 7).unwrap());
    }
}

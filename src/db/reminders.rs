use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::types::ReminderStatus;

impl InvoiceDb {
    // =========================================================================
    // Reminders
    // =========================================================================

    /// Insert a reminder. Returns false when a reminder of the same type
    /// already exists for the invoice — the unique (invoice, type) pair is
    /// what makes scheduler re-runs idempotent.
    pub fn insert_reminder(&self, reminder: &DbReminder) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "INSERT INTO invoice_reminders (
                id, invoice_id, reminder_type, tone, scheduled_at, sent_at,
                status, draft_subject, draft_body, final_subject, final_body,
                approved_by, client_responded, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(invoice_id, reminder_type) DO NOTHING",
            params![
                reminder.id,
                reminder.invoice_id,
                reminder.reminder_type,
                reminder.tone,
                reminder.scheduled_at,
                reminder.sent_at,
                reminder.status,
                reminder.draft_subject,
                reminder.draft_body,
                reminder.final_subject,
                reminder.final_body,
                reminder.approved_by,
                reminder.client_responded,
                reminder.created_at,
                reminder.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Get a single reminder by id.
    pub fn get_reminder(&self, id: &str) -> Result<Option<DbReminder>, DbError> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", REMINDER_SELECT),
                params![id],
                Self::map_reminder_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Count reminders already sent for an invoice. Drives both the
    /// schedule-length cap and the tone table.
    pub fn count_sent_reminders(&self, invoice_id: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM invoice_reminders
             WHERE invoice_id = ?1 AND status = 'sent'",
            params![invoice_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Whether a reminder of this type already exists for the invoice,
    /// regardless of status.
    pub fn reminder_type_exists(
        &self,
        invoice_id: &str,
        reminder_type: &str,
    ) -> Result<bool, DbError> {
        let exists = self
            .conn
            .prepare(
                "SELECT 1 FROM invoice_reminders
                 WHERE invoice_id = ?1 AND reminder_type = ?2",
            )?
            .exists(params![invoice_id, reminder_type])?;
        Ok(exists)
    }

    /// Most recent reminders for an invoice, newest first.
    pub fn get_recent_reminders(
        &self,
        invoice_id: &str,
        limit: usize,
    ) -> Result<Vec<DbReminder>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE invoice_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
            REMINDER_SELECT
        ))?;
        let rows = stmt.query_map(params![invoice_id, limit as i64], Self::map_reminder_row)?;
        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    }

    /// Outstanding (awaiting approval or approved) reminders whose invoice
    /// is already settled — paid or rejected. These are stale and get
    /// auto-skipped before the next due check.
    pub fn get_stale_reminders(&self, tenant_id: &str) -> Result<Vec<DbReminder>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.invoice_id, r.reminder_type, r.tone, r.scheduled_at,
                    r.sent_at, r.status, r.draft_subject, r.draft_body,
                    r.final_subject, r.final_body, r.approved_by,
                    r.client_responded, r.created_at, r.updated_at
             FROM invoice_reminders r
             JOIN invoices i ON r.invoice_id = i.id
             WHERE i.tenant_id = ?1
               AND i.status IN ('paid', 'rejected')
               AND r.status IN ('awaiting_approval', 'approved')",
        )?;
        let rows = stmt.query_map(params![tenant_id], Self::map_reminder_row)?;
        let mut reminders = Vec::new();
        for row in rows {
            reminders.push(row?);
        }
        Ok(reminders)
    }

    /// Approve a reminder: awaiting_approval -> approved, recording the
    /// approver and the final (possibly edited) text. CAS on the status.
    pub fn cas_approve_reminder(
        &self,
        id: &str,
        final_subject: &str,
        final_body: &str,
        approved_by: &str,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoice_reminders SET
                status = 'approved', final_subject = ?1, final_body = ?2,
                approved_by = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'awaiting_approval'",
            params![final_subject, final_body, approved_by, now, id],
        )?;
        Ok(changed > 0)
    }

    /// Mark an approved reminder as sent. `sent_at` is set here and only
    /// here — the status transition is the single source of truth for
    /// "already sent".
    pub fn cas_mark_reminder_sent(&self, id: &str) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoice_reminders SET status = 'sent', sent_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'approved'",
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    /// Move a non-terminal reminder to a terminal skipped/rejected state.
    pub fn cas_close_reminder(
        &self,
        id: &str,
        new_status: ReminderStatus,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoice_reminders SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('awaiting_approval', 'approved')",
            params![new_status, now, id],
        )?;
        Ok(changed > 0)
    }

    /// Helper: map a row to `DbReminder`. Column order matches `REMINDER_SELECT`.
    pub(crate) fn map_reminder_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbReminder> {
        Ok(DbReminder {
            id: row.get(0)?,
            invoice_id: row.get(1)?,
            reminder_type: row.get(2)?,
            tone: row.get(3)?,
            scheduled_at: row.get(4)?,
            sent_at: row.get(5)?,
            status: row.get(6)?,
            draft_subject: row.get(7)?,
            draft_body: row.get(8)?,
            final_subject: row.get(9)?,
            final_body: row.get(10)?,
            approved_by: row.get(11)?,
            client_responded: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

const REMINDER_SELECT: &str = "SELECT id, invoice_id, reminder_type, tone, scheduled_at, sent_at,
        status, draft_subject, draft_body, final_subject, final_body,
        approved_by, client_responded, created_at, updated_at
 FROM invoice_reminders";

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn sample_reminder(id: &str, invoice_id: &str, reminder_type: &str) -> DbReminder {
        let now = Utc::now().to_rfc3339();
        DbReminder {
            id: id.to_string(),
            invoice_id: invoice_id.to_string(),
            reminder_type: reminder_type.to_string(),
            tone: "friendly".to_string(),
            scheduled_at: now.clone(),
            sent_at: None,
            status: ReminderStatus::AwaitingApproval,
            draft_subject: "Invoice INV-001".to_string(),
            draft_body: "A quick nudge".to_string(),
            final_subject: None,
            final_body: None,
            approved_by: None,
            client_responded: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn test_duplicate_type_is_ignored() {
        let db = test_db();
        assert!(db.insert_reminder(&sample_reminder("rem-1", "inv-1", "overdue_7")).unwrap());
        assert!(!db.insert_reminder(&sample_reminder("rem-2", "inv-1", "overdue_7")).unwrap());
        assert!(db.insert_reminder(&sample_reminder("rem-3", "inv-1", "overdue_14")).unwrap());
    }

    #[test]
    fn test_approve_then_send_sets_sent_at() {
        let db = test_db();
        db.insert_reminder(&sample_reminder("rem-1", "inv-1", "overdue_7")).unwrap();

        assert!(db
            .cas_approve_reminder("rem-1", "Subject", "Final body", "ana@tenant.test")
            .unwrap());
        // Approving twice loses the CAS
        assert!(!db
            .cas_approve_reminder("rem-1", "Subject", "Final body", "ana@tenant.test")
            .unwrap());

        assert!(db.cas_mark_reminder_sent("rem-1").unwrap());
        let reminder = db.get_reminder("rem-1").unwrap().expect("found");
        assert_eq!(reminder.status, ReminderStatus::Sent);
        assert!(reminder.sent_at.is_some());
        assert_eq!(reminder.approved_by.as_deref(), Some("ana@tenant.test"));

        // Re-sending loses the CAS — a reminder is sent at most once
        assert!(!db.cas_mark_reminder_sent("rem-1").unwrap());
    }

    #[test]
    fn test_close_reminder_only_from_open_states() {
        let db = test_db();
        db.insert_reminder(&sample_reminder("rem-1", "inv-1", "pre_due_3")).unwrap();

        assert!(db.cas_close_reminder("rem-1", ReminderStatus::Skipped).unwrap());
        // Already terminal
        assert!(!db.cas_close_reminder("rem-1", ReminderStatus::Rejected).unwrap());
    }

    #[test]
    fn test_count_sent_reminders() {
        let db = test_db();
        for (id, typ) in [("rem-1", "pre_due_3"), ("rem-2", "overdue_3"), ("rem-3", "overdue_7")] {
            db.insert_reminder(&sample_reminder(id, "inv-1", typ)).unwrap();
        }
        db.cas_approve_reminder("rem-1", "s", "b", "ana").unwrap();
        db.cas_mark_reminder_sent("rem-1").unwrap();
        db.cas_approve_reminder("rem-2", "s", "b", "ana").unwrap();
        db.cas_mark_reminder_sent("rem-2").unwrap();

        assert_eq!(db.count_sent_reminders("inv-1").unwrap(), 2);
    }
}

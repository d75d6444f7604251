use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::types::InvoiceStatus;

impl InvoiceDb {
    // =========================================================================
    // Invoices
    // =========================================================================

    /// Insert a new invoice. Returns false if an invoice with the same
    /// (tenant, source message) already exists — re-running detection must
    /// not create duplicates.
    pub fn insert_invoice(&self, invoice: &DbInvoice) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "INSERT INTO invoices (
                id, tenant_id, source_message_id, invoice_number, client_name,
                client_email, amount_total, amount_paid, currency, issue_date,
                due_date, status, confidence, notes, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(tenant_id, source_message_id) DO NOTHING",
            params![
                invoice.id,
                invoice.tenant_id,
                invoice.source_message_id,
                invoice.invoice_number,
                invoice.client_name,
                invoice.client_email,
                invoice.amount_total,
                invoice.amount_paid,
                invoice.currency,
                invoice.issue_date,
                invoice.due_date,
                invoice.status,
                invoice.confidence,
                invoice.notes,
                invoice.created_at,
                invoice.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Get a single invoice by id.
    pub fn get_invoice(&self, id: &str) -> Result<Option<DbInvoice>, DbError> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", INVOICE_SELECT),
                params![id],
                Self::map_invoice_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Look up an invoice by its originating message within a tenant.
    pub fn find_invoice_by_source(
        &self,
        tenant_id: &str,
        source_message_id: &str,
    ) -> Result<Option<DbInvoice>, DbError> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE tenant_id = ?1 AND source_message_id = ?2",
                    INVOICE_SELECT
                ),
                params![tenant_id, source_message_id],
                Self::map_invoice_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Invoices for a tenant that can still receive reminders or escalate:
    /// stored status pending, partial, or overdue.
    pub fn get_open_invoices(&self, tenant_id: &str) -> Result<Vec<DbInvoice>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE tenant_id = ?1
               AND status IN ('pending', 'partial', 'overdue')
             ORDER BY due_date ASC",
            INVOICE_SELECT
        ))?;
        let rows = stmt.query_map(params![tenant_id], Self::map_invoice_row)?;
        let mut invoices = Vec::new();
        for row in rows {
            invoices.push(row?);
        }
        Ok(invoices)
    }

    /// Count *other* open invoices for the same tenant + client email that
    /// are past their due date. Drives the critical-severity override.
    pub fn count_other_overdue_for_client(
        &self,
        tenant_id: &str,
        client_email: &str,
        exclude_invoice_id: &str,
        today: &str,
    ) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM invoices
             WHERE tenant_id = ?1
               AND client_email = ?2
               AND id != ?3
               AND status IN ('pending', 'partial', 'overdue')
               AND due_date < ?4",
            params![tenant_id, client_email, exclude_invoice_id, today],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Compare-and-set the status of an invoice. Returns false when the
    /// stored status no longer matches `expected` — the caller lost a race
    /// and must re-read before retrying.
    pub fn cas_invoice_status(
        &self,
        id: &str,
        expected: InvoiceStatus,
        new: InvoiceStatus,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoices SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![new, now, id, expected],
        )?;
        Ok(changed > 0)
    }

    /// Apply human-confirmed fields to a `draft` invoice, guarded on the
    /// draft status so two racing confirmations cannot both win.
    #[allow(clippy::too_many_arguments)]
    pub fn cas_confirm_invoice(
        &self,
        id: &str,
        invoice_number: &Option<String>,
        client_name: &str,
        client_email: &str,
        amount_total: f64,
        due_date: &str,
        notes: &Option<String>,
        new_status: InvoiceStatus,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoices SET
                invoice_number = ?1, client_name = ?2, client_email = ?3,
                amount_total = ?4, due_date = ?5, notes = ?6,
                status = ?7, updated_at = ?8
             WHERE id = ?9 AND status = 'draft'",
            params![
                invoice_number,
                client_name,
                client_email,
                amount_total,
                due_date,
                notes,
                new_status,
                now,
                id
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record a payment installment, guarded on both the status and the
    /// previously observed amount so concurrent payments serialize.
    pub fn cas_record_payment(
        &self,
        id: &str,
        expected_status: InvoiceStatus,
        expected_paid: f64,
        new_paid: f64,
        new_status: InvoiceStatus,
    ) -> Result<bool, DbError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE invoices SET amount_paid = ?1, status = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5 AND amount_paid = ?6",
            params![new_paid, new_status, now, id, expected_status, expected_paid],
        )?;
        Ok(changed > 0)
    }

    /// Helper: map a row to `DbInvoice`. Column order matches `INVOICE_SELECT`.
    pub(crate) fn map_invoice_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbInvoice> {
        Ok(DbInvoice {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            source_message_id: row.get(2)?,
            invoice_number: row.get(3)?,
            client_name: row.get(4)?,
            client_email: row.get(5)?,
            amount_total: row.get(6)?,
            amount_paid: row.get(7)?,
            currency: row.get(8)?,
            issue_date: row.get(9)?,
            due_date: row.get(10)?,
            status: row.get(11)?,
            confidence: row.get(12)?,
            notes: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

const INVOICE_SELECT: &str = "SELECT id, tenant_id, source_message_id, invoice_number, client_name,
        client_email, amount_total, amount_paid, currency, issue_date,
        due_date, status, confidence, notes, created_at, updated_at
 FROM invoices";

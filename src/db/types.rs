//! Row structs for the invoice tables.

use serde::Serialize;

use crate::types::{InvoiceStatus, ReminderStatus};

/// A row from the `invoices` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInvoice {
    pub id: String,
    pub tenant_id: String,
    pub source_message_id: String,
    pub invoice_number: Option<String>,
    pub client_name: String,
    pub client_email: String,
    pub amount_total: f64,
    pub amount_paid: f64,
    pub currency: String,
    pub issue_date: Option<String>,
    /// Due date as `YYYY-MM-DD`.
    pub due_date: String,
    pub status: InvoiceStatus,
    pub confidence: f64,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `invoice_reminders` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbReminder {
    pub id: String,
    pub invoice_id: String,
    /// Tag identifying the schedule offset, e.g. `pre_due_3` or `overdue_7`.
    pub reminder_type: String,
    pub tone: String,
    pub scheduled_at: String,
    pub sent_at: Option<String>,
    pub status: ReminderStatus,
    pub draft_subject: String,
    pub draft_body: String,
    pub final_subject: Option<String>,
    pub final_body: Option<String>,
    pub approved_by: Option<String>,
    pub client_responded: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the append-only `invoice_actions` ledger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInvoiceAction {
    pub id: String,
    pub tenant_id: String,
    pub invoice_id: String,
    pub run_id: Option<String>,
    pub action_type: String,
    pub actor: String,
    /// Structured details payload (JSON).
    pub details: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: String,
}

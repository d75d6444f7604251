//! Collaborator channels: message drafting, human notification, and
//! outbound mail.
//!
//! The engine never composes natural language or touches SMTP itself —
//! these traits are the narrow seams to the external services that do.
//! Implementations are injected at `EngineState` construction; tests use
//! the in-crate mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbInvoice;
use crate::types::Tone;

pub mod http;

#[cfg(test)]
pub mod mock;

pub use http::{HttpDrafting, HttpMail, HttpNotifier};

/// Action ids offered on a reminder-approval notification.
pub const ACTION_APPROVE: &str = "approve";
pub const ACTION_EDIT: &str = "edit";
pub const ACTION_SKIP: &str = "skip";
pub const ACTION_REJECT: &str = "reject";

/// Suggested human actions on an escalation notification.
pub const SUGGEST_CALL_CLIENT: &str = "call_client";
pub const SUGGEST_FINAL_NOTICE: &str = "send_final_notice";
pub const SUGGEST_MARK_PAID: &str = "mark_paid";
pub const SUGGEST_ADD_NOTE: &str = "add_note";

/// Errors from any collaborator channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("{0} endpoint not configured")]
    NotConfigured(&'static str),
}

/// Condensed invoice fields shared with collaborators. Carries only what a
/// draft or a notification needs, never the whole row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub invoice_id: String,
    pub invoice_number: Option<String>,
    pub client_name: String,
    pub client_email: String,
    pub amount_total: f64,
    pub amount_paid: f64,
    pub currency: String,
    pub due_date: String,
    /// Effective status: `pending`/`partial` past the due date reads as
    /// `overdue` here, whatever the row still says.
    pub status: String,
}

impl InvoiceSummary {
    pub fn from_invoice(invoice: &DbInvoice) -> Self {
        let today = chrono::Utc::now().date_naive();
        Self {
            invoice_id: invoice.id.clone(),
            invoice_number: invoice.invoice_number.clone(),
            client_name: invoice.client_name.clone(),
            client_email: invoice.client_email.clone(),
            amount_total: invoice.amount_total,
            amount_paid: invoice.amount_paid,
            currency: invoice.currency.clone(),
            due_date: invoice.due_date.clone(),
            status: crate::invoice::effective_status(invoice.status, &invoice.due_date, today)
                .as_str()
                .to_string(),
        }
    }
}

/// Request for a reminder draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    pub summary: InvoiceSummary,
    pub days_overdue: i64,
    pub reminder_count: usize,
    pub tone: Tone,
}

/// A drafted reminder message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftResponse {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A message for a human, with the action set they can respond with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    /// Routing target — the tenant id; the channel resolves it to an
    /// actual destination (chat workspace, phone, inbox).
    pub target: String,
    pub title: String,
    pub body: String,
    pub actions: Vec<String>,
    /// Structured context the channel can render (invoice summary,
    /// reminder history, severity).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

/// An outbound reminder email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Reference to the originating thread, when the mail provider can
    /// reply in-thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
}

/// Drafts reminder text in the requested tone.
#[async_trait]
pub trait DraftingChannel: Send + Sync {
    async fn draft(&self, request: &DraftRequest) -> Result<DraftResponse, ChannelError>;
}

/// Delivers a message with action buttons to a human; returns an opaque
/// message handle.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, request: &NotifyRequest) -> Result<String, ChannelError>;
}

/// Delivers a reminder email; returns the provider's delivery id.
#[async_trait]
pub trait MailChannel: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<String, ChannelError>;
}

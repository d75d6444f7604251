//! Human decision intake.
//!
//! Notification channels post decisions back as JSON; this is the single
//! entry point that turns a decision payload into the corresponding state
//! transition. Replayed payloads are safe: the CAS-guarded transitions
//! absorb duplicates.

use serde::Deserialize;

use crate::error::EngineError;
use crate::invoice::{confirm_invoice, reject_invoice, ConfirmData};
use crate::reminders::{approve_reminder, reject_reminder, skip_reminder};
use crate::state::EngineState;

/// Edited invoice fields attached to a confirmation decision.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmFields {
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub amount_total: Option<f64>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<ConfirmFields> for ConfirmData {
    fn from(fields: ConfirmFields) -> Self {
        ConfirmData {
            invoice_number: fields.invoice_number,
            client_name: fields.client_name,
            client_email: fields.client_email,
            amount_total: fields.amount_total,
            due_date: fields.due_date,
            notes: fields.notes,
        }
    }
}

/// A decision posted back by a human through a notification channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Send the reminder as drafted.
    Approve { reminder_id: String, actor: String },
    /// Send the reminder with edited text.
    Edit {
        reminder_id: String,
        subject: String,
        body: String,
        actor: String,
    },
    /// Skip this occurrence; the schedule slot stays consumed.
    Skip { reminder_id: String, actor: String },
    /// Reject the draft outright.
    Reject { reminder_id: String, actor: String },
    /// Confirm a low-confidence draft invoice, optionally with edits.
    ConfirmInvoice {
        invoice_id: String,
        #[serde(default)]
        fields: ConfirmFields,
        actor: String,
    },
    /// Reject a detected invoice (false positive, duplicate).
    RejectInvoice {
        invoice_id: String,
        reason: String,
        actor: String,
    },
    /// Record a payment against an invoice.
    RecordPayment {
        invoice_id: String,
        amount: f64,
        payment_date: String,
        actor: String,
    },
}

/// Apply one decision. Errors surface unchanged so the channel layer can
/// tell the human what went wrong (stale button, already sent, conflict).
pub async fn apply_decision(state: &EngineState, decision: Decision) -> Result<(), EngineError> {
    match decision {
        Decision::Approve { reminder_id, actor } => {
            approve_reminder(state, &reminder_id, None, None, &actor).await?;
            Ok(())
        }
        Decision::Edit {
            reminder_id,
            subject,
            body,
            actor,
        } => {
            approve_reminder(state, &reminder_id, Some(&subject), Some(&body), &actor).await?;
            Ok(())
        }
        Decision::Skip { reminder_id, actor } => {
            let db = state.db.lock();
            skip_reminder(&db, &reminder_id, &actor)
        }
        Decision::Reject { reminder_id, actor } => {
            let db = state.db.lock();
            reject_reminder(&db, &reminder_id, &actor)
        }
        Decision::ConfirmInvoice {
            invoice_id,
            fields,
            actor,
        } => {
            let db = state.db.lock();
            confirm_invoice(&db, &invoice_id, &fields.into(), &actor)?;
            Ok(())
        }
        Decision::RejectInvoice {
            invoice_id,
            reason,
            actor,
        } => {
            let db = state.db.lock();
            reject_invoice(&db, &invoice_id, &reason, &actor)
        }
        Decision::RecordPayment {
            invoice_id,
            amount,
            payment_date,
            actor,
        } => {
            let db = state.db.lock();
            crate::invoice::record_payment(&db, &invoice_id, amount, &payment_date, &actor)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::detect_invoice;
    use crate::reminders::scan_due_reminders;
    use crate::state::test_utils::test_state;
    use crate::types::{ExtractedInvoice, InvoiceStatus, ReminderStatus};
    use chrono::Utc;

    fn extraction(source: &str, confidence: f64, due_in_days: i64) -> ExtractedInvoice {
        let due = Utc::now().date_naive() + chrono::Duration::days(due_in_days);
        ExtractedInvoice {
            source_message_id: source.to_string(),
            invoice_number: None,
            client_name: "Acme".to_string(),
            client_email: "billing@acme.test".to_string(),
            amount_total: 1500.0,
            amount_paid: 0.0,
            currency: "USD".to_string(),
            issue_date: None,
            due_date: due.format("%Y-%m-%d").to_string(),
            notes: None,
            confidence,
        }
    }

    #[test]
    fn test_decision_payloads_deserialize() {
        let approve: Decision = serde_json::from_str(
            r#"{"action": "approve", "reminder_id": "rem-1", "actor": "ana"}"#,
        )
        .unwrap();
        assert!(matches!(approve, Decision::Approve { .. }));

        let edit: Decision = serde_json::from_str(
            r#"{"action": "edit", "reminder_id": "rem-1",
                "subject": "s", "body": "b", "actor": "ana"}"#,
        )
        .unwrap();
        assert!(matches!(edit, Decision::Edit { .. }));

        let confirm: Decision = serde_json::from_str(
            r#"{"action": "confirm_invoice", "invoice_id": "inv-1",
                "fields": {"amountTotal": 1800.0}, "actor": "ana"}"#,
        )
        .unwrap();
        match confirm {
            Decision::ConfirmInvoice { fields, .. } => {
                assert_eq!(fields.amount_total, Some(1800.0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_approve_decision_sends() {
        let harness = test_state();
        let outcome = detect_invoice(&harness.state, "t1", &extraction("msg-1", 0.95, -7))
            .await
            .unwrap();
        scan_due_reminders(&harness.state, "t1").await.unwrap();

        let reminder_id = {
            let db = harness.state.db.lock();
            db.get_recent_reminders(&outcome.invoice.id, 5).unwrap()[0].id.clone()
        };

        apply_decision(
            &harness.state,
            Decision::Approve {
                reminder_id: reminder_id.clone(),
                actor: "ana".to_string(),
            },
        )
        .await
        .unwrap();

        let db = harness.state.db.lock();
        let reminder = db.get_reminder(&reminder_id).unwrap().unwrap();
        assert_eq!(reminder.status, ReminderStatus::Sent);
    }

    #[tokio::test]
    async fn test_replayed_skip_fails_cleanly() {
        let harness = test_state();
        let outcome = detect_invoice(&harness.state, "t1", &extraction("msg-1", 0.95, -7))
            .await
            .unwrap();
        scan_due_reminders(&harness.state, "t1").await.unwrap();

        let reminder_id = {
            let db = harness.state.db.lock();
            db.get_recent_reminders(&outcome.invoice.id, 5).unwrap()[0].id.clone()
        };

        let skip = Decision::Skip {
            reminder_id: reminder_id.clone(),
            actor: "ana".to_string(),
        };
        apply_decision(&harness.state, skip.clone()).await.unwrap();
        let replay = apply_decision(&harness.state, skip).await;
        assert!(matches!(replay, Err(EngineError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_confirm_invoice_decision() {
        let harness = test_state();
        let outcome = detect_invoice(&harness.state, "t1", &extraction("msg-1", 0.55, 14))
            .await
            .unwrap();
        assert_eq!(outcome.invoice.status, InvoiceStatus::Draft);

        apply_decision(
            &harness.state,
            Decision::ConfirmInvoice {
                invoice_id: outcome.invoice.id.clone(),
                fields: ConfirmFields::default(),
                actor: "ana".to_string(),
            },
        )
        .await
        .unwrap();

        let db = harness.state.db.lock();
        let invoice = db.get_invoice(&outcome.invoice.id).unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_payment_decision() {
        let harness = test_state();
        let outcome = detect_invoice(&harness.state, "t1", &extraction("msg-1", 0.95, 14))
            .await
            .unwrap();

        apply_decision(
            &harness.state,
            Decision::RecordPayment {
                invoice_id: outcome.invoice.id.clone(),
                amount: 1500.0,
                payment_date: "2026-08-30".to_string(),
                actor: "ana".to_string(),
            },
        )
        .await
        .unwrap();

        let db = harness.state.db.lock();
        let invoice = db.get_invoice(&outcome.invoice.id).unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }
}

//! Invoice state machine.
//!
//! States: detected -> draft -> pending -> {overdue, partial, paid} ->
//! {paid, rejected}, with rejected reachable from detected/draft/pending.
//! Every transition is a compare-and-set guarded on the expected current
//! row, so two triggers racing on the same invoice serialize — the loser
//! gets `ConflictRetry` and writes nothing.
//!
//! "Overdue" is derived, not independently stored: `effective_status` is
//! the single pure function every read/scan path goes through.

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::channels::{InvoiceSummary, NotifyRequest, ACTION_APPROVE, ACTION_EDIT, ACTION_REJECT};
use crate::db::ledger::{
    NewAction, ACTION_APPROVAL_REQUESTED, ACTION_CONFIRMED, ACTION_DETECTED, ACTION_MARKED_PAID,
    ACTION_REJECTED, ACTOR_AGENT,
};
use crate::db::{DbInvoice, InvoiceDb};
use crate::error::EngineError;
use crate::state::EngineState;
use crate::types::{ExtractedInvoice, InvoiceStatus};

/// Usage category metered once per detected source message.
const USAGE_DETECTED: &str = "invoices_detected";

/// Parse a `YYYY-MM-DD` due date, rejecting anything else.
pub fn parse_due_date(due_date: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(due_date, "%Y-%m-%d")
        .map_err(|_| EngineError::Validation(format!("invalid due date: {due_date}")))
}

/// Days past the due date; negative before it.
pub fn days_overdue(due_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - due_date).num_days()
}

/// The single overdue derivation. `pending`/`partial` rows past their due
/// date read as `overdue`; everything else reads as stored. A malformed
/// due date falls back to the stored status.
pub fn effective_status(status: InvoiceStatus, due_date: &str, today: NaiveDate) -> InvoiceStatus {
    match status {
        InvoiceStatus::Pending | InvoiceStatus::Partial => {
            match NaiveDate::parse_from_str(due_date, "%Y-%m-%d") {
                Ok(due) if today > due => InvoiceStatus::Overdue,
                _ => status,
            }
        }
        other => other,
    }
}

/// Pick the status a confirmed or high-confidence invoice lands in, from
/// its amounts and due date.
fn evaluate_status(
    amount_total: f64,
    amount_paid: f64,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    if amount_paid >= amount_total && amount_total > 0.0 {
        InvoiceStatus::Paid
    } else if today > due_date {
        InvoiceStatus::Overdue
    } else {
        InvoiceStatus::Pending
    }
}

/// Result of running detection output through the state machine.
#[derive(Debug)]
pub struct DetectionOutcome {
    pub invoice: DbInvoice,
    /// False when the (tenant, source message) pair was already known and
    /// the call was an idempotent no-op.
    pub created: bool,
    /// True when the invoice landed in `draft` and a confirmation request
    /// went out.
    pub needs_confirmation: bool,
}

fn validate_extraction(extraction: &ExtractedInvoice) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&extraction.confidence) {
        return Err(EngineError::Validation(format!(
            "confidence {} out of [0, 1]",
            extraction.confidence
        )));
    }
    if extraction.amount_total < 0.0 || !extraction.amount_total.is_finite() {
        return Err(EngineError::Validation(format!(
            "invalid amount_total: {}",
            extraction.amount_total
        )));
    }
    if extraction.client_email.trim().is_empty() {
        return Err(EngineError::Validation("client_email is empty".to_string()));
    }
    if extraction.source_message_id.trim().is_empty() {
        return Err(EngineError::Validation(
            "source_message_id is empty".to_string(),
        ));
    }
    parse_due_date(&extraction.due_date)?;
    Ok(())
}

/// Create an invoice from extraction output.
///
/// Confidence at or above the configured threshold skips human review and
/// lands directly in pending/overdue/paid; below it the invoice is a
/// `draft` and a confirmation request is sent on the notification channel.
/// Re-running detection for a known source message is an idempotent no-op.
pub async fn detect_invoice(
    state: &EngineState,
    tenant_id: &str,
    extraction: &ExtractedInvoice,
) -> Result<DetectionOutcome, EngineError> {
    validate_extraction(extraction)?;
    let threshold = state.config.read().confidence_threshold;
    let today = Utc::now().date_naive();
    let due = parse_due_date(&extraction.due_date)?;

    let status = if extraction.confidence >= threshold {
        evaluate_status(extraction.amount_total, extraction.amount_paid, due, today)
    } else {
        InvoiceStatus::Draft
    };

    let now = Utc::now().to_rfc3339();
    let invoice = DbInvoice {
        id: format!("inv-{}", Uuid::new_v4()),
        tenant_id: tenant_id.to_string(),
        source_message_id: extraction.source_message_id.clone(),
        invoice_number: extraction.invoice_number.clone(),
        client_name: extraction.client_name.clone(),
        client_email: extraction.client_email.clone(),
        amount_total: extraction.amount_total,
        amount_paid: extraction.amount_paid,
        currency: extraction.currency.clone(),
        issue_date: extraction.issue_date.clone(),
        due_date: extraction.due_date.clone(),
        status,
        confidence: extraction.confidence,
        notes: extraction.notes.clone(),
        created_at: now.clone(),
        updated_at: now,
    };

    // Insert + audit commit together; the confirmation notification happens
    // after the lock is released.
    let outcome = {
        let db = state.db.lock();
        let created = db.with_transaction(|db| {
            let created = db.insert_invoice(&invoice)?;
            if created {
                db.append_action(&NewAction {
                    tenant_id,
                    invoice_id: &invoice.id,
                    run_id: None,
                    action_type: ACTION_DETECTED,
                    actor: ACTOR_AGENT,
                    details: Some(serde_json::json!({
                        "sourceMessageId": invoice.source_message_id,
                        "status": invoice.status.as_str(),
                        "amountTotal": invoice.amount_total,
                    })),
                    confidence: Some(extraction.confidence),
                })?;
            }
            Ok(created)
        })?;

        if !created {
            let existing = db
                .find_invoice_by_source(tenant_id, &extraction.source_message_id)?
                .ok_or_else(|| {
                    EngineError::ConflictRetry(extraction.source_message_id.clone())
                })?;
            return Ok(DetectionOutcome {
                invoice: existing,
                created: false,
                needs_confirmation: false,
            });
        }

        db.record_usage(tenant_id, USAGE_DETECTED, &extraction.source_message_id)?;
        invoice.clone()
    };

    let needs_confirmation = status == InvoiceStatus::Draft;
    if needs_confirmation {
        request_confirmation(state, tenant_id, &outcome).await;
    }

    Ok(DetectionOutcome {
        invoice: outcome,
        created: true,
        needs_confirmation,
    })
}

/// Ask a human to confirm a low-confidence draft. A notification failure
/// is still audited — the ledger reflects attempted-but-failed sends.
async fn request_confirmation(state: &EngineState, tenant_id: &str, invoice: &DbInvoice) {
    let request = NotifyRequest {
        target: tenant_id.to_string(),
        title: format!(
            "Confirm detected invoice from {} ({:.0}% confidence)",
            invoice.client_name,
            invoice.confidence * 100.0
        ),
        body: format!(
            "{} {} due {} — extraction confidence was below the auto-accept threshold.",
            invoice.amount_total, invoice.currency, invoice.due_date
        ),
        actions: vec![
            ACTION_APPROVE.to_string(),
            ACTION_EDIT.to_string(),
            ACTION_REJECT.to_string(),
        ],
        context: serde_json::json!(InvoiceSummary::from_invoice(invoice)),
    };

    let result = state.notifier.notify(&request).await;
    let details = match &result {
        Ok(handle) => serde_json::json!({"messageHandle": handle}),
        Err(e) => serde_json::json!({"failed": true, "error": e.to_string()}),
    };
    if let Err(ref e) = result {
        log::warn!(
            "Confirmation notification failed for {}: {}",
            invoice.id,
            e
        );
    }

    let db = state.db.lock();
    if let Err(e) = db.append_action(&NewAction {
        tenant_id,
        invoice_id: &invoice.id,
        run_id: None,
        action_type: ACTION_APPROVAL_REQUESTED,
        actor: ACTOR_AGENT,
        details: Some(details),
        confidence: Some(invoice.confidence),
    }) {
        log::error!("Failed to audit confirmation request for {}: {}", invoice.id, e);
    }
}

/// Human-edited fields applied on confirmation. `None` keeps the
/// extracted value.
#[derive(Debug, Clone, Default)]
pub struct ConfirmData {
    pub invoice_number: Option<String>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub amount_total: Option<f64>,
    pub due_date: Option<String>,
    pub notes: Option<String>,
}

/// Confirm a `draft` invoice with (possibly edited) fields.
///
/// Only valid from `draft`; re-evaluates due date and amounts to pick the
/// resulting status. Invalid states fail with `PreconditionFailed` and
/// write nothing.
pub fn confirm_invoice(
    db: &InvoiceDb,
    invoice_id: &str,
    data: &ConfirmData,
    actor: &str,
) -> Result<DbInvoice, EngineError> {
    let invoice = db
        .get_invoice(invoice_id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(invoice_id.to_string()))?;
    confirm_snapshot(db, &invoice, data, actor, Utc::now().date_naive())
}

/// Confirmation against an already-read snapshot. Split out so the race
/// between snapshot and CAS is directly testable.
pub(crate) fn confirm_snapshot(
    db: &InvoiceDb,
    invoice: &DbInvoice,
    data: &ConfirmData,
    actor: &str,
    today: NaiveDate,
) -> Result<DbInvoice, EngineError> {
    if invoice.status != InvoiceStatus::Draft {
        return Err(EngineError::PreconditionFailed(format!(
            "confirm on {} invoice {}",
            invoice.status.as_str(),
            invoice.id
        )));
    }

    let invoice_number = data.invoice_number.clone().or(invoice.invoice_number.clone());
    let client_name = data.client_name.clone().unwrap_or(invoice.client_name.clone());
    let client_email = data.client_email.clone().unwrap_or(invoice.client_email.clone());
    let amount_total = data.amount_total.unwrap_or(invoice.amount_total);
    let due_date = data.due_date.clone().unwrap_or(invoice.due_date.clone());
    let notes = data.notes.clone().or(invoice.notes.clone());

    if amount_total < 0.0 || !amount_total.is_finite() {
        return Err(EngineError::Validation(format!(
            "invalid amount_total: {amount_total}"
        )));
    }
    let due = parse_due_date(&due_date)?;
    let new_status = evaluate_status(amount_total, invoice.amount_paid, due, today);

    let changed = db.with_transaction(|db| {
        let changed = db.cas_confirm_invoice(
            &invoice.id,
            &invoice_number,
            &client_name,
            &client_email,
            amount_total,
            &due_date,
            &notes,
            new_status,
        )?;
        if changed {
            db.append_action(&NewAction {
                tenant_id: &invoice.tenant_id,
                invoice_id: &invoice.id,
                run_id: None,
                action_type: ACTION_CONFIRMED,
                actor,
                details: Some(serde_json::json!({
                    "resultingStatus": new_status.as_str(),
                    "amountTotal": amount_total,
                    "dueDate": due_date,
                })),
                confidence: Some(invoice.confidence),
            })?;
        }
        Ok(changed)
    })?;

    if !changed {
        return Err(EngineError::ConflictRetry(invoice.id.clone()));
    }

    db.get_invoice(&invoice.id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(invoice.id.clone()))
}

/// Reject an invoice. Terminal; valid from detected/draft/pending. The
/// reason lands in the audit details — rejection replaces deletion.
pub fn reject_invoice(
    db: &InvoiceDb,
    invoice_id: &str,
    reason: &str,
    actor: &str,
) -> Result<(), EngineError> {
    let invoice = db
        .get_invoice(invoice_id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(invoice_id.to_string()))?;

    if !matches!(
        invoice.status,
        InvoiceStatus::Detected | InvoiceStatus::Draft | InvoiceStatus::Pending
    ) {
        return Err(EngineError::PreconditionFailed(format!(
            "reject on {} invoice {}",
            invoice.status.as_str(),
            invoice.id
        )));
    }

    let changed = db.with_transaction(|db| {
        let changed =
            db.cas_invoice_status(&invoice.id, invoice.status, InvoiceStatus::Rejected)?;
        if changed {
            db.append_action(&NewAction {
                tenant_id: &invoice.tenant_id,
                invoice_id: &invoice.id,
                run_id: None,
                action_type: ACTION_REJECTED,
                actor,
                details: Some(serde_json::json!({"reason": reason})),
                confidence: None,
            })?;
        }
        Ok(changed)
    })?;

    if !changed {
        return Err(EngineError::ConflictRetry(invoice.id.clone()));
    }
    Ok(())
}

/// Record a payment installment.
///
/// Amounts are incremental deltas and accumulate. Reaching the total flips
/// the invoice to `paid`; anything between zero and the total is
/// `partial`. Overpayment is recorded, not blocked. Every installment
/// writes its own `marked_paid` audit row.
pub fn record_payment(
    db: &InvoiceDb,
    invoice_id: &str,
    amount: f64,
    payment_date: &str,
    actor: &str,
) -> Result<DbInvoice, EngineError> {
    if amount <= 0.0 || !amount.is_finite() {
        return Err(EngineError::Validation(format!(
            "payment amount must be positive, got {amount}"
        )));
    }

    let invoice = db
        .get_invoice(invoice_id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(invoice_id.to_string()))?;

    if invoice.status == InvoiceStatus::Rejected {
        return Err(EngineError::PreconditionFailed(format!(
            "payment on rejected invoice {}",
            invoice.id
        )));
    }

    let new_paid = invoice.amount_paid + amount;
    let new_status = if new_paid >= invoice.amount_total {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Partial
    };

    let changed = db.with_transaction(|db| {
        let changed = db.cas_record_payment(
            &invoice.id,
            invoice.status,
            invoice.amount_paid,
            new_paid,
            new_status,
        )?;
        if changed {
            db.append_action(&NewAction {
                tenant_id: &invoice.tenant_id,
                invoice_id: &invoice.id,
                run_id: None,
                action_type: ACTION_MARKED_PAID,
                actor,
                details: Some(serde_json::json!({
                    "amount": amount,
                    "amountPaid": new_paid,
                    "paymentDate": payment_date,
                    "resultingStatus": new_status.as_str(),
                })),
                confidence: None,
            })?;
        }
        Ok(changed)
    })?;

    if !changed {
        return Err(EngineError::ConflictRetry(invoice.id.clone()));
    }

    db.get_invoice(&invoice.id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(invoice.id.clone()))
}

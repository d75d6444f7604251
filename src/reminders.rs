//! Reminder scheduling and the approve-then-send flow.
//!
//! The daily scan walks every open invoice, matches its distance from the
//! due date against the configured day offsets, drafts reminder text in
//! the tone the sent-count dictates, and parks the result in
//! `awaiting_approval`. Nothing reaches a client without a human approval;
//! the send itself is a second, explicit step.
//!
//! Scheduling is idempotent at two layers: the scan only considers exact
//! offset matches, and the `(invoice_id, reminder_type)` unique constraint
//! absorbs replays of the same scan day.

use chrono::Utc;
use uuid::Uuid;

use crate::channels::{
    DraftRequest, InvoiceSummary, NotifyRequest, OutboundMail, ACTION_APPROVE, ACTION_EDIT,
    ACTION_REJECT, ACTION_SKIP,
};
use crate::db::ledger::{
    NewAction, ACTION_APPROVAL_REQUESTED, ACTION_REMINDER_DRAFTED, ACTION_REMINDER_REJECTED,
    ACTION_REMINDER_SCHEDULED, ACTION_REMINDER_SENT, ACTION_REMINDER_SKIPPED, ACTOR_AGENT,
    ACTOR_SYSTEM,
};
use crate::db::{DbInvoice, DbReminder, InvoiceDb};
use crate::error::EngineError;
use crate::invoice::days_overdue;
use crate::state::EngineState;
use crate::types::{ReminderStatus, ScanTrace, Tone};

/// Usage category metered once per reminder actually delivered.
const USAGE_SENT: &str = "reminders_sent";

/// Stable tag for a schedule offset: `pre_due_3`, `due_date`, `overdue_7`.
/// One reminder per invoice per tag, ever.
pub fn reminder_type_for_offset(offset: i64) -> String {
    match offset {
        0 => "due_date".to_string(),
        n if n < 0 => format!("pre_due_{}", -n),
        n => format!("overdue_{n}"),
    }
}

/// Tone escalates with the number of reminders already sent, never with
/// calendar time alone.
pub fn tone_for_sent_count(sent_count: usize) -> Tone {
    match sent_count {
        0 => Tone::Friendly,
        1 => Tone::Professional,
        _ => Tone::Firm,
    }
}

/// A reminder slot the scan decided to fill, captured while the database
/// lock was held.
struct Candidate {
    invoice: DbInvoice,
    reminder_type: String,
    tone: Tone,
    days_overdue: i64,
    sent_count: usize,
}

/// Run one reminder scan for a tenant. Returns the number of reminders
/// scheduled.
pub async fn scan_due_reminders(
    state: &EngineState,
    tenant_id: &str,
) -> Result<usize, EngineError> {
    let run_id = format!("run-{}", Uuid::new_v4());
    let mut trace = ScanTrace::new();
    let today = Utc::now().date_naive();
    let offsets = state.config.read().reminder_offsets.clone();

    // Phase 1: sweep reminders orphaned by a paid/rejected invoice, then
    // collect candidates. All synchronous, one lock hold.
    let candidates = {
        let db = state.db.lock();

        let stale = db.get_stale_reminders(tenant_id)?;
        let mut swept = 0usize;
        for reminder in &stale {
            swept += auto_skip_stale(&db, tenant_id, reminder, &run_id)? as usize;
        }
        trace.ok("stale_sweep", format!("{swept} auto-skipped"));

        let mut candidates = Vec::new();
        for invoice in db.get_open_invoices(tenant_id)? {
            let due = match chrono::NaiveDate::parse_from_str(&invoice.due_date, "%Y-%m-%d") {
                Ok(d) => d,
                Err(_) => {
                    trace.failed("collect", format!("{}: bad due date", invoice.id));
                    continue;
                }
            };
            let days = days_overdue(due, today);
            let Some(&offset) = offsets.iter().find(|&&o| o == days) else {
                continue;
            };

            let sent_count = db.count_sent_reminders(&invoice.id)?;
            if sent_count >= offsets.len() {
                continue;
            }
            let reminder_type = reminder_type_for_offset(offset);
            if db.reminder_type_exists(&invoice.id, &reminder_type)? {
                continue;
            }

            candidates.push(Candidate {
                invoice,
                reminder_type,
                tone: tone_for_sent_count(sent_count),
                days_overdue: days,
                sent_count,
            });
        }
        trace.ok("collect", format!("{} candidates", candidates.len()));
        candidates
    };

    // Phase 2: draft and park, one candidate at a time. The lock is not
    // held across the channel calls.
    let mut scheduled = 0usize;
    for candidate in candidates {
        match schedule_candidate(state, tenant_id, &candidate, &run_id).await {
            Ok(true) => scheduled += 1,
            Ok(false) => {}
            Err(e) => {
                trace.failed("schedule", format!("{}: {}", candidate.invoice.id, e));
                log::warn!(
                    "Failed to schedule {} for {}: {}",
                    candidate.reminder_type,
                    candidate.invoice.id,
                    e
                );
            }
        }
    }

    trace.ok("schedule", format!("{scheduled} scheduled"));
    log::info!("Reminder scan for {tenant_id} ({run_id}): {}", trace.summary());
    Ok(scheduled)
}

/// Close a reminder whose invoice left the open set before approval
/// arrived. Actor is the system, not a human.
fn auto_skip_stale(
    db: &InvoiceDb,
    tenant_id: &str,
    reminder: &DbReminder,
    run_id: &str,
) -> Result<bool, EngineError> {
    let closed = db.with_transaction(|db| {
        let closed = db.cas_close_reminder(&reminder.id, ReminderStatus::Skipped)?;
        if closed {
            db.append_action(&NewAction {
                tenant_id,
                invoice_id: &reminder.invoice_id,
                run_id: Some(run_id),
                action_type: ACTION_REMINDER_SKIPPED,
                actor: ACTOR_SYSTEM,
                details: Some(serde_json::json!({
                    "reminderId": reminder.id,
                    "reminderType": reminder.reminder_type,
                    "reason": "invoice_closed",
                })),
                confidence: None,
            })?;
        }
        Ok(closed)
    })?;
    Ok(closed)
}

/// Draft text for one candidate and park it awaiting approval. Returns
/// false when a replay or a racing scan already filled the slot.
async fn schedule_candidate(
    state: &EngineState,
    tenant_id: &str,
    candidate: &Candidate,
    run_id: &str,
) -> Result<bool, EngineError> {
    let invoice = &candidate.invoice;
    let request = DraftRequest {
        summary: InvoiceSummary::from_invoice(invoice),
        days_overdue: candidate.days_overdue,
        reminder_count: candidate.sent_count,
        tone: candidate.tone,
    };

    let draft = match state.drafting.draft(&request).await {
        Ok(draft) => draft,
        Err(e) => {
            // The slot stays empty; the next scan for a later offset will
            // try again. The failure still lands in the ledger.
            let db = state.db.lock();
            db.append_action(&NewAction {
                tenant_id,
                invoice_id: &invoice.id,
                run_id: Some(run_id),
                action_type: ACTION_REMINDER_DRAFTED,
                actor: ACTOR_AGENT,
                details: Some(serde_json::json!({
                    "failed": true,
                    "reminderType": candidate.reminder_type,
                    "error": e.to_string(),
                })),
                confidence: None,
            })?;
            return Err(EngineError::collaborator("drafting", e.to_string()));
        }
    };

    let now = Utc::now().to_rfc3339();
    let reminder = DbReminder {
        id: format!("rem-{}", Uuid::new_v4()),
        invoice_id: invoice.id.clone(),
        reminder_type: candidate.reminder_type.clone(),
        tone: candidate.tone.as_str().to_string(),
        scheduled_at: now.clone(),
        sent_at: None,
        status: ReminderStatus::AwaitingApproval,
        draft_subject: draft.subject.clone(),
        draft_body: draft.body.clone(),
        final_subject: None,
        final_body: None,
        approved_by: None,
        client_responded: false,
        created_at: now.clone(),
        updated_at: now,
    };

    let inserted = {
        let db = state.db.lock();
        db.with_transaction(|db| {
            let inserted = db.insert_reminder(&reminder)?;
            if inserted {
                db.append_action(&NewAction {
                    tenant_id,
                    invoice_id: &invoice.id,
                    run_id: Some(run_id),
                    action_type: ACTION_REMINDER_SCHEDULED,
                    actor: ACTOR_AGENT,
                    details: Some(serde_json::json!({
                        "reminderId": reminder.id,
                        "reminderType": reminder.reminder_type,
                        "tone": reminder.tone,
                        "daysOverdue": candidate.days_overdue,
                    })),
                    confidence: None,
                })?;
                db.append_action(&NewAction {
                    tenant_id,
                    invoice_id: &invoice.id,
                    run_id: Some(run_id),
                    action_type: ACTION_REMINDER_DRAFTED,
                    actor: ACTOR_AGENT,
                    details: Some(serde_json::json!({
                        "reminderId": reminder.id,
                        "subject": draft.subject,
                        "draftConfidence": draft.confidence,
                    })),
                    confidence: None,
                })?;
            }
            Ok(inserted)
        })?
    };

    if !inserted {
        return Ok(false);
    }

    request_approval(state, tenant_id, invoice, &reminder, run_id).await;
    Ok(true)
}

/// Notify the tenant that a drafted reminder needs sign-off. Failure is
/// audited, not fatal — the reminder stays parked.
async fn request_approval(
    state: &EngineState,
    tenant_id: &str,
    invoice: &DbInvoice,
    reminder: &DbReminder,
    run_id: &str,
) {
    let request = NotifyRequest {
        target: tenant_id.to_string(),
        title: format!(
            "Reminder drafted for {} ({})",
            invoice.client_name, reminder.reminder_type
        ),
        body: reminder.draft_subject.clone(),
        actions: vec![
            ACTION_APPROVE.to_string(),
            ACTION_EDIT.to_string(),
            ACTION_SKIP.to_string(),
            ACTION_REJECT.to_string(),
        ],
        context: serde_json::json!({
            "reminderId": reminder.id,
            "tone": reminder.tone,
            "invoice": InvoiceSummary::from_invoice(invoice),
        }),
    };

    let result = state.notifier.notify(&request).await;
    let details = match &result {
        Ok(handle) => serde_json::json!({
            "reminderId": reminder.id,
            "messageHandle": handle,
        }),
        Err(e) => serde_json::json!({
            "reminderId": reminder.id,
            "failed": true,
            "error": e.to_string(),
        }),
    };
    if let Err(ref e) = result {
        log::warn!("Approval notification failed for {}: {}", reminder.id, e);
    }

    let db = state.db.lock();
    if let Err(e) = db.append_action(&NewAction {
        tenant_id,
        invoice_id: &invoice.id,
        run_id: Some(run_id),
        action_type: ACTION_APPROVAL_REQUESTED,
        actor: ACTOR_AGENT,
        details: Some(details),
        confidence: None,
    }) {
        log::error!("Failed to audit approval request for {}: {}", reminder.id, e);
    }
}

/// Approve a parked reminder and deliver it.
///
/// `final_subject`/`final_body` carry human edits; `None` keeps the draft.
/// A mail failure leaves the reminder `approved` so the call can simply be
/// retried; only a confirmed delivery moves it to `sent` and meters usage.
pub async fn approve_reminder(
    state: &EngineState,
    reminder_id: &str,
    final_subject: Option<&str>,
    final_body: Option<&str>,
    approver: &str,
) -> Result<String, EngineError> {
    let (tenant_id, invoice, reminder) = {
        let db = state.db.lock();
        let reminder = db
            .get_reminder(reminder_id)?
            .ok_or_else(|| EngineError::ReminderNotFound(reminder_id.to_string()))?;
        let invoice = db
            .get_invoice(&reminder.invoice_id)?
            .ok_or_else(|| EngineError::InvoiceNotFound(reminder.invoice_id.clone()))?;

        match reminder.status {
            ReminderStatus::Sent => {
                return Err(EngineError::PreconditionFailed(format!(
                    "reminder {reminder_id} was already sent"
                )));
            }
            ReminderStatus::Skipped | ReminderStatus::Rejected => {
                return Err(EngineError::PreconditionFailed(format!(
                    "reminder {reminder_id} is {}",
                    reminder.status.as_str()
                )));
            }
            ReminderStatus::AwaitingApproval => {
                let subject = final_subject.unwrap_or(&reminder.draft_subject);
                let body = final_body.unwrap_or(&reminder.draft_body);
                if !db.cas_approve_reminder(reminder_id, subject, body, approver)? {
                    return Err(EngineError::ConflictRetry(reminder_id.to_string()));
                }
            }
            // Already approved: a previous send attempt failed. Fall
            // through and retry delivery with the recorded final text.
            ReminderStatus::Approved => {}
        }

        let reminder = db
            .get_reminder(reminder_id)?
            .ok_or_else(|| EngineError::ReminderNotFound(reminder_id.to_string()))?;
        (invoice.tenant_id.clone(), invoice, reminder)
    };

    let mail = OutboundMail {
        to: invoice.client_email.clone(),
        subject: reminder
            .final_subject
            .clone()
            .unwrap_or_else(|| reminder.draft_subject.clone()),
        body: reminder
            .final_body
            .clone()
            .unwrap_or_else(|| reminder.draft_body.clone()),
        thread_ref: Some(invoice.source_message_id.clone()),
    };

    match state.mail.send(&mail).await {
        Ok(delivery_id) => {
            let db = state.db.lock();
            let sent = db.with_transaction(|db| {
                let sent = db.cas_mark_reminder_sent(reminder_id)?;
                if sent {
                    db.append_action(&NewAction {
                        tenant_id: &tenant_id,
                        invoice_id: &invoice.id,
                        run_id: None,
                        action_type: ACTION_REMINDER_SENT,
                        actor: approver,
                        details: Some(serde_json::json!({
                            "reminderId": reminder_id,
                            "reminderType": reminder.reminder_type,
                            "tone": reminder.tone,
                            "deliveryId": delivery_id,
                        })),
                        confidence: None,
                    })?;
                }
                Ok(sent)
            })?;
            if !sent {
                // The mail went out but another caller committed first.
                log::warn!("Lost send race for reminder {reminder_id} after delivery");
                return Err(EngineError::ConflictRetry(reminder_id.to_string()));
            }
            db.record_usage(&tenant_id, USAGE_SENT, reminder_id)?;
            Ok(delivery_id)
        }
        Err(e) => {
            let db = state.db.lock();
            db.append_action(&NewAction {
                tenant_id: &tenant_id,
                invoice_id: &invoice.id,
                run_id: None,
                action_type: ACTION_REMINDER_SENT,
                actor: approver,
                details: Some(serde_json::json!({
                    "reminderId": reminder_id,
                    "failed": true,
                    "error": e.to_string(),
                })),
                confidence: None,
            })?;
            Err(EngineError::collaborator("mail", e.to_string()))
        }
    }
}

/// Skip a parked reminder: this occurrence will not be sent, and its
/// `(invoice, reminder_type)` slot stays consumed.
pub fn skip_reminder(db: &InvoiceDb, reminder_id: &str, actor: &str) -> Result<(), EngineError> {
    close_reminder(db, reminder_id, ReminderStatus::Skipped, ACTION_REMINDER_SKIPPED, actor)
}

/// Reject a parked reminder's draft outright.
pub fn reject_reminder(db: &InvoiceDb, reminder_id: &str, actor: &str) -> Result<(), EngineError> {
    close_reminder(db, reminder_id, ReminderStatus::Rejected, ACTION_REMINDER_REJECTED, actor)
}

fn close_reminder(
    db: &InvoiceDb,
    reminder_id: &str,
    new_status: ReminderStatus,
    action_type: &'static str,
    actor: &str,
) -> Result<(), EngineError> {
    let reminder = db
        .get_reminder(reminder_id)?
        .ok_or_else(|| EngineError::ReminderNotFound(reminder_id.to_string()))?;
    if reminder.status.is_terminal() {
        return Err(EngineError::PreconditionFailed(format!(
            "reminder {reminder_id} is {}",
            reminder.status.as_str()
        )));
    }
    let invoice = db
        .get_invoice(&reminder.invoice_id)?
        .ok_or_else(|| EngineError::InvoiceNotFound(reminder.invoice_id.clone()))?;

    let closed = db.with_transaction(|db| {
        let closed = db.cas_close_reminder(reminder_id, new_status)?;
        if closed {
            db.append_action(&NewAction {
                tenant_id: &invoice.tenant_id,
                invoice_id: &invoice.id,
                run_id: None,
                action_type,
                actor,
                details: Some(serde_json::json!({
                    "reminderId": reminder_id,
                    "reminderType": reminder.reminder_type,
                })),
                confidence: None,
            })?;
        }
        Ok(closed)
    })?;

    if !closed {
        return Err(EngineError::ConflictRetry(reminder_id.to_string()));
    }
    Ok(())
}

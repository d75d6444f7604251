//! Escalation pattern detection.
//!
//! Once a day, after the reminder scan, every open invoice is classified
//! against a fixed, ordered rule set. The first matching rule wins, except
//! the multiple-overdue-invoices-per-client override, which outranks
//! everything. A detected problem surfaces to the human with suggested
//! next moves; the engine never acts on a pattern by itself.
//!
//! Dedup is fingerprint-based: the same (invoice, pattern, severity)
//! within the mute window stays silent, so a stuck invoice produces one
//! nudge per window instead of one per day.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::channels::{
    InvoiceSummary, NotifyRequest, SUGGEST_ADD_NOTE, SUGGEST_CALL_CLIENT, SUGGEST_FINAL_NOTICE,
    SUGGEST_MARK_PAID,
};
use crate::db::ledger::{NewAction, ACTION_ESCALATED, ACTOR_AGENT};
use crate::db::DbInvoice;
use crate::error::EngineError;
use crate::invoice::days_overdue;
use crate::state::EngineState;
use crate::types::{ScanTrace, Severity};

/// Usage category metered once per surfaced escalation fingerprint.
const USAGE_ESCALATIONS: &str = "escalations";

pub const PATTERN_REPEATED_REMINDERS: &str = "repeated_reminders";
pub const PATTERN_LONG_OVERDUE: &str = "long_overdue";
pub const PATTERN_EXTENDED_DELAY: &str = "extended_delay";
pub const PATTERN_MULTIPLE_OVERDUE: &str = "multiple_invoices_overdue";

/// A detected collection problem on one invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    pub pattern: &'static str,
    pub severity: Severity,
    pub description: String,
}

/// Inputs to classification, read under the database lock in one pass.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub sent_reminders: usize,
    pub days_overdue: i64,
    /// Other overdue invoices for the same tenant and client email.
    pub other_overdue: usize,
}

/// Classify one invoice. Ordered rules, first match wins; the
/// multiple-overdue override replaces whatever the base rules found.
pub fn classify(obs: &Observation) -> Option<Problem> {
    let base = if obs.sent_reminders >= 3 {
        Some(Problem {
            pattern: PATTERN_REPEATED_REMINDERS,
            severity: Severity::High,
            description: format!("{} reminders sent with no payment", obs.sent_reminders),
        })
    } else if obs.days_overdue >= 30 {
        Some(Problem {
            pattern: PATTERN_LONG_OVERDUE,
            severity: Severity::High,
            description: format!("{} days past due", obs.days_overdue),
        })
    } else if obs.sent_reminders >= 2 && obs.days_overdue >= 14 {
        Some(Problem {
            pattern: PATTERN_EXTENDED_DELAY,
            severity: Severity::Medium,
            description: format!(
                "{} reminders and {} days past due",
                obs.sent_reminders, obs.days_overdue
            ),
        })
    } else {
        None
    };

    if obs.other_overdue > 0 {
        return Some(Problem {
            pattern: PATTERN_MULTIPLE_OVERDUE,
            severity: Severity::Critical,
            description: format!(
                "client has {} other overdue invoice(s)",
                obs.other_overdue
            ),
        });
    }
    base
}

/// Stable dedup key for one problem occurrence. Severity is part of the
/// key so a worsening pattern re-alerts inside the mute window.
pub fn fingerprint(invoice_id: &str, pattern: &str, severity: Severity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(invoice_id.as_bytes());
    hasher.update(b"|");
    hasher.update(pattern.as_bytes());
    hasher.update(b"|");
    hasher.update(severity.as_str().as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..16].to_string()
}

struct Detected {
    invoice: DbInvoice,
    problem: Problem,
    fingerprint: String,
    recent_types: Vec<String>,
}

/// Run one escalation pass for a tenant. Returns the number of problems
/// surfaced (after dedup).
pub async fn check_escalations(
    state: &EngineState,
    tenant_id: &str,
) -> Result<usize, EngineError> {
    let run_id = format!("run-{}", Uuid::new_v4());
    let mut trace = ScanTrace::new();
    let today = Utc::now().date_naive();
    let today_str = today.format("%Y-%m-%d").to_string();
    let mute_days = state.config.read().escalation_mute_days;

    let detected = {
        let db = state.db.lock();
        let mut detected = Vec::new();
        for invoice in db.get_open_invoices(tenant_id)? {
            let due = match chrono::NaiveDate::parse_from_str(&invoice.due_date, "%Y-%m-%d") {
                Ok(d) => d,
                Err(_) => {
                    trace.failed("classify", format!("{}: bad due date", invoice.id));
                    continue;
                }
            };
            let obs = Observation {
                sent_reminders: db.count_sent_reminders(&invoice.id)?,
                days_overdue: days_overdue(due, today).max(0),
                other_overdue: db.count_other_overdue_for_client(
                    tenant_id,
                    &invoice.client_email,
                    &invoice.id,
                    &today_str,
                )?,
            };
            let Some(problem) = classify(&obs) else {
                continue;
            };

            let fp = fingerprint(&invoice.id, problem.pattern, problem.severity);
            if db.has_recent_escalation(&invoice.id, &fp, mute_days)? {
                continue;
            }

            let recent_types = db
                .get_recent_reminders(&invoice.id, 3)?
                .into_iter()
                .map(|r| r.reminder_type)
                .collect();
            detected.push(Detected {
                invoice,
                problem,
                fingerprint: fp,
                recent_types,
            });
        }
        trace.ok("classify", format!("{} problems", detected.len()));
        detected
    };

    let mut surfaced = 0usize;
    for item in detected {
        match surface_problem(state, tenant_id, &item, &run_id).await {
            Ok(()) => surfaced += 1,
            Err(e) => {
                trace.failed("surface", format!("{}: {}", item.invoice.id, e));
                log::warn!(
                    "Failed to surface {} for {}: {}",
                    item.problem.pattern,
                    item.invoice.id,
                    e
                );
            }
        }
    }

    trace.ok("surface", format!("{surfaced} surfaced"));
    log::info!(
        "Escalation pass for {tenant_id} ({run_id}): {}",
        trace.summary()
    );
    Ok(surfaced)
}

/// Suggested actions scale with severity; the human chooses, the engine
/// never sends a final notice or places a call on its own.
fn suggested_actions(severity: Severity) -> Vec<String> {
    let mut actions = vec![SUGGEST_CALL_CLIENT.to_string()];
    if severity >= Severity::High {
        actions.push(SUGGEST_FINAL_NOTICE.to_string());
    }
    actions.push(SUGGEST_MARK_PAID.to_string());
    actions.push(SUGGEST_ADD_NOTE.to_string());
    actions
}

/// Notify the tenant about one problem and audit the escalation. A failed
/// notification is audited with `failed: true` and does NOT consume the
/// fingerprint's mute window.
async fn surface_problem(
    state: &EngineState,
    tenant_id: &str,
    item: &Detected,
    run_id: &str,
) -> Result<(), EngineError> {
    let invoice = &item.invoice;
    let problem = &item.problem;

    let request = NotifyRequest {
        target: tenant_id.to_string(),
        title: format!(
            "[{}] {} on {}",
            problem.severity.as_str(),
            problem.pattern,
            invoice.client_name
        ),
        body: problem.description.clone(),
        actions: suggested_actions(problem.severity),
        context: serde_json::json!({
            "invoice": InvoiceSummary::from_invoice(invoice),
            "recentReminders": item.recent_types,
        }),
    };

    let result = state.notifier.notify(&request).await;
    let failed = result.is_err();
    let details = match &result {
        Ok(handle) => serde_json::json!({
            "pattern": problem.pattern,
            "severity": problem.severity.as_str(),
            "fingerprint": item.fingerprint,
            "description": problem.description,
            "messageHandle": handle,
        }),
        Err(e) => serde_json::json!({
            "pattern": problem.pattern,
            "severity": problem.severity.as_str(),
            "fingerprint": item.fingerprint,
            "failed": true,
            "error": e.to_string(),
        }),
    };

    {
        let db = state.db.lock();
        db.append_action(&NewAction {
            tenant_id,
            invoice_id: &invoice.id,
            run_id: Some(run_id),
            action_type: ACTION_ESCALATED,
            actor: ACTOR_AGENT,
            details: Some(details),
            confidence: None,
        })?;
        if !failed {
            db.record_usage(tenant_id, USAGE_ESCALATIONS, &item.fingerprint)?;
        }
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(EngineError::collaborator("notify", e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ledger::ActionFilter;
    use crate::invoice::detect_invoice;
    use crate::state::test_utils::test_state;
    use crate::types::ExtractedInvoice;
    use std::sync::atomic::Ordering;

    fn extraction(source: &str, email: &str, due_in_days: i64) -> ExtractedInvoice {
        let due = Utc::now().date_naive() + chrono::Duration::days(due_in_days);
        ExtractedInvoice {
            source_message_id: source.to_string(),
            invoice_number: None,
            client_name: "Acme".to_string(),
            client_email: email.to_string(),
            amount_total: 1500.0,
            amount_paid: 0.0,
            currency: "USD".to_string(),
            issue_date: None,
            due_date: due.format("%Y-%m-%d").to_string(),
            notes: None,
            confidence: 0.95,
        }
    }

    fn obs(sent: usize, days: i64, other: usize) -> Observation {
        Observation {
            sent_reminders: sent,
            days_overdue: days,
            other_overdue: other,
        }
    }

    #[test]
    fn test_rule_order_first_match_wins() {
        // 3+ reminders outranks long_overdue even at 40 days
        let p = classify(&obs(3, 40, 0)).unwrap();
        assert_eq!(p.pattern, PATTERN_REPEATED_REMINDERS);
        assert_eq!(p.severity, Severity::High);

        let p = classify(&obs(0, 35, 0)).unwrap();
        assert_eq!(p.pattern, PATTERN_LONG_OVERDUE);

        let p = classify(&obs(2, 20, 0)).unwrap();
        assert_eq!(p.pattern, PATTERN_EXTENDED_DELAY);
        assert_eq!(p.severity, Severity::Medium);
    }

    #[test]
    fn test_multiple_overdue_overrides_everything() {
        // Even with a base match, the client-level pattern wins
        let p = classify(&obs(3, 40, 1)).unwrap();
        assert_eq!(p.pattern, PATTERN_MULTIPLE_OVERDUE);
        assert_eq!(p.severity, Severity::Critical);

        // And it fires with no base problem at all
        let p = classify(&obs(0, 0, 2)).unwrap();
        assert_eq!(p.pattern, PATTERN_MULTIPLE_OVERDUE);
    }

    #[test]
    fn test_healthy_invoice_classifies_clean() {
        assert!(classify(&obs(1, 10, 0)).is_none());
        assert!(classify(&obs(2, 13, 0)).is_none());
        assert!(classify(&obs(0, 29, 0)).is_none());
    }

    #[test]
    fn test_fingerprint_varies_by_severity() {
        let a = fingerprint("inv-1", PATTERN_LONG_OVERDUE, Severity::High);
        let b = fingerprint("inv-1", PATTERN_LONG_OVERDUE, Severity::Critical);
        let c = fingerprint("inv-2", PATTERN_LONG_OVERDUE, Severity::High);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, fingerprint("inv-1", PATTERN_LONG_OVERDUE, Severity::High));
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_long_overdue_surfaces_once_per_window() {
        let harness = test_state();
        detect_invoice(&harness.state, "t1", &extraction("msg-1", "a@x.test", -35))
            .await
            .unwrap();

        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 1);
        // Same pattern the next day stays muted
        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 0);

        let notifications = harness.notifier.notifications.lock();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].title.contains(PATTERN_LONG_OVERDUE));
        assert!(notifications[0]
            .actions
            .contains(&SUGGEST_FINAL_NOTICE.to_string()));
    }

    #[tokio::test]
    async fn test_two_overdue_invoices_same_client_go_critical() {
        let harness = test_state();
        detect_invoice(&harness.state, "t1", &extraction("msg-1", "a@x.test", -5))
            .await
            .unwrap();
        detect_invoice(&harness.state, "t1", &extraction("msg-2", "a@x.test", -8))
            .await
            .unwrap();

        // Both invoices trigger the client-level pattern
        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 2);

        let notifications = harness.notifier.notifications.lock();
        assert!(notifications
            .iter()
            .all(|n| n.title.contains(PATTERN_MULTIPLE_OVERDUE)));
        assert!(notifications.iter().all(|n| n.title.contains("critical")));
    }

    #[tokio::test]
    async fn test_different_clients_do_not_cross_trigger() {
        let harness = test_state();
        detect_invoice(&harness.state, "t1", &extraction("msg-1", "a@x.test", -5))
            .await
            .unwrap();
        detect_invoice(&harness.state, "t1", &extraction("msg-2", "b@y.test", -8))
            .await
            .unwrap();

        // Neither invoice matches any per-invoice rule or the client rule
        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_consume_window() {
        let harness = test_state();
        detect_invoice(&harness.state, "t1", &extraction("msg-1", "a@x.test", -35))
            .await
            .unwrap();

        harness.notifier.fail.store(true, Ordering::SeqCst);
        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 0);

        // The failed attempt is audited but does not mute the retry
        harness.notifier.fail.store(false, Ordering::SeqCst);
        assert_eq!(check_escalations(&harness.state, "t1").await.unwrap(), 1);

        let db = harness.state.db.lock();
        let page = db
            .query_actions(&ActionFilter {
                tenant_id: Some("t1".to_string()),
                action_type: Some(ACTION_ESCALATED.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.actions.len(), 2);
        let period = Utc::now().format("%Y-%m").to_string();
        assert_eq!(db.get_usage("t1", USAGE_ESCALATIONS, &period).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_escalation_meters_usage_once_per_fingerprint() {
        let harness = test_state();
        detect_invoice(&harness.state, "t1", &extraction("msg-1", "a@x.test", -35))
            .await
            .unwrap();
        check_escalations(&harness.state, "t1").await.unwrap();
        check_escalations(&harness.state, "t1").await.unwrap();

        let db = harness.state.db.lock();
        let period = Utc::now().format("%Y-%m").to_string();
        assert_eq!(db.get_usage("t1", USAGE_ESCALATIONS, &period).unwrap(), 1);
    }
}

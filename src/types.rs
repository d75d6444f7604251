use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Configuration stored in ~/.dunner/config.json
///
/// Every field has a default so a missing or partial file still yields a
/// runnable engine; only the channel endpoints genuinely need user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Override for the SQLite database path. Defaults to `~/.dunner/dunner.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Extraction confidence at or above which a detected invoice skips
    /// human confirmation.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Signed day offsets relative to the due date at which reminders fire.
    /// Negative = days before due date.
    #[serde(default = "default_reminder_offsets")]
    pub reminder_offsets: Vec<i64>,
    /// Suppress a repeat escalation for the same (invoice, pattern) for this
    /// many days after one was delivered.
    #[serde(default = "default_escalation_mute_days")]
    pub escalation_mute_days: u32,
    #[serde(default)]
    pub schedules: Schedules,
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            confidence_threshold: default_confidence_threshold(),
            reminder_offsets: default_reminder_offsets(),
            escalation_mute_days: default_escalation_mute_days(),
            schedules: Schedules::default(),
            channels: ChannelConfig::default(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.80
}

fn default_reminder_offsets() -> Vec<i64> {
    vec![-3, 3, 7, 14]
}

fn default_escalation_mute_days() -> u32 {
    7
}

/// Cron schedules for the two periodic engine passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    #[serde(default = "default_reminder_schedule")]
    pub reminder_check: ScheduleEntry,
    #[serde(default = "default_escalation_schedule")]
    pub escalation_check: ScheduleEntry,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            reminder_check: default_reminder_schedule(),
            escalation_check: default_escalation_schedule(),
        }
    }
}

fn default_reminder_schedule() -> ScheduleEntry {
    ScheduleEntry {
        enabled: true,
        cron: "0 9 * * *".to_string(),
        timezone: "UTC".to_string(),
    }
}

fn default_escalation_schedule() -> ScheduleEntry {
    ScheduleEntry {
        enabled: true,
        cron: "30 9 * * *".to_string(),
        timezone: "UTC".to_string(),
    }
}

/// A single cron schedule with its timezone (5-field cron expression).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
}

/// Endpoints for the drafting, notification, and mail channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drafting_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_url: Option<String>,
    /// Bearer token sent to all three endpoints when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

/// Load config from `~/.dunner/config.json`, falling back to defaults when
/// the file is absent or unreadable.
pub fn load_config() -> Config {
    let path = match dirs::home_dir() {
        Some(home) => home.join(".dunner").join("config.json"),
        None => return Config::default(),
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

// ---------------------------------------------------------------------------
// Invoice + reminder status
// ---------------------------------------------------------------------------

/// Lifecycle status of an invoice.
///
/// `Overdue` is stored once an operation observes it, but the authoritative
/// check is always the derived `invoice::effective_status` — `Pending` and
/// `Partial` rows past their due date read as overdue without a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Detected,
    Draft,
    Pending,
    Partial,
    Overdue,
    Paid,
    Rejected,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Detected => "detected",
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(InvoiceStatus::Detected),
            "draft" => Some(InvoiceStatus::Draft),
            "pending" => Some(InvoiceStatus::Pending),
            "partial" => Some(InvoiceStatus::Partial),
            "overdue" => Some(InvoiceStatus::Overdue),
            "paid" => Some(InvoiceStatus::Paid),
            "rejected" => Some(InvoiceStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal statuses accept no further transitions except payment
    /// accumulation on `Paid`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Rejected)
    }
}

impl ToSql for InvoiceStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for InvoiceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        InvoiceStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown invoice status: {s}").into()))
    }
}

/// Lifecycle status of a single reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    AwaitingApproval,
    Approved,
    Sent,
    Skipped,
    Rejected,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::AwaitingApproval => "awaiting_approval",
            ReminderStatus::Approved => "approved",
            ReminderStatus::Sent => "sent",
            ReminderStatus::Skipped => "skipped",
            ReminderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_approval" => Some(ReminderStatus::AwaitingApproval),
            "approved" => Some(ReminderStatus::Approved),
            "sent" => Some(ReminderStatus::Sent),
            "skipped" => Some(ReminderStatus::Skipped),
            "rejected" => Some(ReminderStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReminderStatus::Sent | ReminderStatus::Skipped | ReminderStatus::Rejected
        )
    }
}

impl ToSql for ReminderStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ReminderStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ReminderStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown reminder status: {s}").into()))
    }
}

/// Drafting style for a reminder, derived purely from how many reminders
/// were already sent for the invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Friendly,
    Professional,
    Firm,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Friendly => "friendly",
            Tone::Professional => "professional",
            Tone::Firm => "firm",
        }
    }
}

/// Escalation urgency. `Critical` outranks everything and is reserved for
/// the multiple-overdue-invoices-per-client override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction output
// ---------------------------------------------------------------------------

/// Structured record returned by the external extraction service for one
/// inbound document. The engine consumes only the field set and the
/// confidence; parsing the document is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedInvoice {
    /// Id of the originating message; unique per tenant, the dedup key
    /// against repeated detection runs.
    pub source_message_id: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
    pub client_name: String,
    pub client_email: String,
    pub amount_total: f64,
    #[serde(default)]
    pub amount_paid: f64,
    pub currency: String,
    #[serde(default)]
    pub issue_date: Option<String>,
    /// Due date as `YYYY-MM-DD`.
    pub due_date: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Extraction confidence in [0.0, 1.0].
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Scan trace
// ---------------------------------------------------------------------------

/// Outcome of one stage of a scan pass.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Ok(String),
    Failed(String),
}

/// One entry in a scan's step log.
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage: &'static str,
    pub at: DateTime<Utc>,
    pub outcome: StageOutcome,
}

/// Ordered, append-only record of what a single scan pass did, stage by
/// stage. Replaces threading an untyped map through the flow.
#[derive(Debug, Default)]
pub struct ScanTrace {
    stages: Vec<StageRecord>,
}

impl ScanTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self, stage: &'static str, summary: impl Into<String>) {
        self.stages.push(StageRecord {
            stage,
            at: Utc::now(),
            outcome: StageOutcome::Ok(summary.into()),
        });
    }

    pub fn failed(&mut self, stage: &'static str, error: impl Into<String>) {
        self.stages.push(StageRecord {
            stage,
            at: Utc::now(),
            outcome: StageOutcome::Failed(error.into()),
        });
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn failure_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed(_)))
            .count()
    }

    /// Render a one-line summary for the scan completion log.
    pub fn summary(&self) -> String {
        self.stages
            .iter()
            .map(|s| match &s.outcome {
                StageOutcome::Ok(msg) => format!("{}: {}", s.stage, msg),
                StageOutcome::Failed(err) => format!("{}: FAILED ({})", s.stage, err),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(config.confidence_threshold, 0.80);
        assert_eq!(config.reminder_offsets, vec![-3, 3, 7, 14]);
        assert_eq!(config.escalation_mute_days, 7);
        assert!(config.schedules.reminder_check.enabled);
    }

    #[test]
    fn test_config_partial_override() {
        let config: Config =
            serde_json::from_str(r#"{"reminderOffsets": [-7, 0, 10]}"#).expect("parse");
        assert_eq!(config.reminder_offsets, vec![-7, 0, 10]);
        assert_eq!(config.confidence_threshold, 0.80);
    }

    #[test]
    fn test_invoice_status_round_trip() {
        for status in [
            InvoiceStatus::Detected,
            InvoiceStatus::Draft,
            InvoiceStatus::Pending,
            InvoiceStatus::Partial,
            InvoiceStatus::Overdue,
            InvoiceStatus::Paid,
            InvoiceStatus::Rejected,
        ] {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::parse("bogus"), None);
    }

    #[test]
    fn test_reminder_status_terminal() {
        assert!(ReminderStatus::Sent.is_terminal());
        assert!(ReminderStatus::Skipped.is_terminal());
        assert!(ReminderStatus::Rejected.is_terminal());
        assert!(!ReminderStatus::AwaitingApproval.is_terminal());
        assert!(!ReminderStatus::Approved.is_terminal());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
    }

    #[test]
    fn test_scan_trace_summary() {
        let mut trace = ScanTrace::new();
        trace.ok("collect", "3 candidates");
        trace.failed("draft", "timeout");
        assert_eq!(trace.failure_count(), 1);
        let summary = trace.summary();
        assert!(summary.contains("collect: 3 candidates"));
        assert!(summary.contains("draft: FAILED"));
    }
}

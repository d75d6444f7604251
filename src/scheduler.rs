//! Cron-driven job scheduling.
//!
//! A one-minute poll loop checks the two daily jobs (reminder scan,
//! escalation pass) against their cron schedules and fans each due run
//! out over every known tenant. Sleep/wake gaps are handled by time-jump
//! detection plus a grace window for missed runs, so a laptop lid or a
//! container pause does not silently drop a collection day — the
//! scheduling idempotency guards make the catch-up run safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::escalation::check_escalations;
use crate::reminders::scan_due_reminders;
use crate::state::EngineState;
use crate::types::ScheduleEntry;

/// Grace period for missed jobs (2 hours)
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for scheduler loop (1 minute)
const POLL_INTERVAL_SECS: u64 = 60;

/// The two recurring jobs the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ReminderCheck,
    EscalationCheck,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ReminderCheck => "reminder_check",
            JobKind::EscalationCheck => "escalation_check",
        }
    }
}

/// How a job run came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTrigger {
    Scheduled,
    Missed,
    Manual,
}

/// Message sent to trigger one job run for one tenant.
#[derive(Debug, Clone)]
pub struct SchedulerMessage {
    pub tenant_id: String,
    pub job: JobKind,
    pub trigger: ExecutionTrigger,
}

/// Poll-loop scheduler for the daily collection jobs.
pub struct Scheduler {
    state: Arc<EngineState>,
    sender: mpsc::Sender<SchedulerMessage>,
}

impl Scheduler {
    pub fn new(state: Arc<EngineState>, sender: mpsc::Sender<SchedulerMessage>) -> Self {
        Self { state, sender }
    }

    /// Run the scheduler loop indefinitely, checking for due jobs every
    /// minute and catching up after sleep/wake gaps.
    pub async fn run(&self) {
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let now = Utc::now();

            // Detect sleep: time jumped more than 5 minutes
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed jobs",
                    time_jump
                );
                self.check_missed_jobs(now).await;
            }

            self.check_and_run_due_jobs(now).await;

            last_check = now;
        }
    }

    /// Check for jobs that should run now
    async fn check_and_run_due_jobs(&self, now: DateTime<Utc>) {
        let schedules = self.state.config.read().schedules.clone();

        if schedules.reminder_check.enabled {
            if let Ok(true) =
                self.should_run_now(&schedules.reminder_check, JobKind::ReminderCheck, now)
            {
                self.trigger_job(JobKind::ReminderCheck, ExecutionTrigger::Scheduled, now)
                    .await;
            }
        }

        if schedules.escalation_check.enabled {
            if let Ok(true) =
                self.should_run_now(&schedules.escalation_check, JobKind::EscalationCheck, now)
            {
                self.trigger_job(JobKind::EscalationCheck, ExecutionTrigger::Scheduled, now)
                    .await;
            }
        }
    }

    /// Check if a job should run at the given time
    fn should_run_now(
        &self,
        entry: &ScheduleEntry,
        job: JobKind,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid timezone: {}", entry.timezone)))?;

        let now_local = now.with_timezone(&tz);
        let last_run = self.state.get_last_scheduled_run(job);

        // Find the most recent scheduled time that's <= now
        let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));

        if let Some(next_time) = scheduled_times.next() {
            let next_utc = next_time.with_timezone(&Utc);
            let diff = (now - next_utc).num_seconds().abs();

            // Within 2 minutes of scheduled time (wider window for sleep/wake)
            if diff < 120 {
                // Check if we already ran this scheduled time
                if let Some(last) = last_run {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Check for jobs that were missed during sleep
    async fn check_missed_jobs(&self, now: DateTime<Utc>) {
        let schedules = self.state.config.read().schedules.clone();

        if schedules.reminder_check.enabled {
            if let Ok(Some(_)) =
                self.find_missed_job(&schedules.reminder_check, JobKind::ReminderCheck, now)
            {
                log::info!("Found missed reminder check, running now");
                self.trigger_job(JobKind::ReminderCheck, ExecutionTrigger::Missed, now)
                    .await;
            }
        }

        if schedules.escalation_check.enabled {
            if let Ok(Some(_)) =
                self.find_missed_job(&schedules.escalation_check, JobKind::EscalationCheck, now)
            {
                log::info!("Found missed escalation check, running now");
                self.trigger_job(JobKind::EscalationCheck, ExecutionTrigger::Missed, now)
                    .await;
            }
        }
    }

    /// Find a missed job within the grace period.
    fn find_missed_job(
        &self,
        entry: &ScheduleEntry,
        job: JobKind,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| EngineError::Validation(format!("invalid timezone: {}", entry.timezone)))?;

        let now_local = now.with_timezone(&tz);
        let grace_start = now_local - chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS);
        let last_run = self.state.get_last_scheduled_run(job);

        for scheduled in schedule.after(&grace_start) {
            let scheduled_utc = scheduled.with_timezone(&Utc);
            if scheduled_utc > now {
                break;
            }
            if let Some(last) = last_run {
                if last >= scheduled_utc {
                    continue;
                }
            }
            return Ok(Some(scheduled_utc));
        }

        Ok(None)
    }

    /// Fan one job run out over every known tenant.
    async fn trigger_job(&self, job: JobKind, trigger: ExecutionTrigger, now: DateTime<Utc>) {
        self.state.set_last_scheduled_run(job, now);

        let tenants = {
            let db = self.state.db.lock();
            match db.list_tenants() {
                Ok(tenants) => tenants,
                Err(e) => {
                    log::error!("Failed to list tenants for {}: {}", job.as_str(), e);
                    return;
                }
            }
        };

        if tenants.is_empty() {
            log::debug!("No tenants to run {} for", job.as_str());
            return;
        }

        for tenant_id in tenants {
            if self
                .sender
                .send(SchedulerMessage {
                    tenant_id,
                    job,
                    trigger,
                })
                .await
                .is_err()
            {
                log::error!("Failed to send scheduler message for {:?}", job);
                return;
            }
        }
    }
}

/// Run jobs off the scheduler channel until it closes.
pub async fn run_executor(state: Arc<EngineState>, mut receiver: mpsc::Receiver<SchedulerMessage>) {
    while let Some(message) = receiver.recv().await {
        let result = match message.job {
            JobKind::ReminderCheck => scan_due_reminders(&state, &message.tenant_id).await,
            JobKind::EscalationCheck => check_escalations(&state, &message.tenant_id).await,
        };
        match result {
            Ok(count) => {
                log::info!(
                    "{} for {} ({:?}): {} item(s)",
                    message.job.as_str(),
                    message.tenant_id,
                    message.trigger,
                    count
                );
            }
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "{} for {} hit a retryable failure, next run will catch up: {}",
                    message.job.as_str(),
                    message.tenant_id,
                    e
                );
            }
            Err(e) => {
                log::error!(
                    "{} for {} failed: {}",
                    message.job.as_str(),
                    message.tenant_id,
                    e
                );
            }
        }
    }
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, EngineError> {
    // The cron crate expects 6 fields (with seconds), but we use 5-field format
    // Add "0" for seconds at the start
    let full_expr = format!("0 {}", expr);

    full_expr
        .parse::<Schedule>()
        .map_err(|e| EngineError::Validation(format!("invalid cron expression '{expr}': {e}")))
}

/// Get the next scheduled time for a job
pub fn get_next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, EngineError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| EngineError::Validation(format!("invalid timezone: {}", entry.timezone)))?;

    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| EngineError::Validation("no upcoming scheduled time".to_string()))?;

    Ok(next.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_daily_9am() {
        assert!(parse_cron("0 9 * * *").is_ok());
    }

    #[test]
    fn test_parse_cron_weekdays() {
        assert!(parse_cron("30 9 * * 1-5").is_ok());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_get_next_run_time() {
        let entry = ScheduleEntry {
            enabled: true,
            cron: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
        };
        assert!(get_next_run_time(&entry).is_ok());
    }

    #[test]
    fn test_get_next_run_time_bad_timezone() {
        let entry = ScheduleEntry {
            enabled: true,
            cron: "0 9 * * *".to_string(),
            timezone: "Mars/Olympus".to_string(),
        };
        assert!(matches!(
            get_next_run_time(&entry),
            Err(EngineError::Validation(_))
        ));
    }
}

//! Shared engine state: the database handle, configuration, and the
//! injected collaborator channels.
//!
//! There is no process-wide singleton — the binary (or an embedding host)
//! constructs one `EngineState` explicitly and hands `Arc`s to the
//! scheduler and executor. The DB mutex is never held across a channel
//! await; orchestration reads under the lock, drops it, performs I/O, and
//! reacquires to commit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::channels::{DraftingChannel, MailChannel, NotificationChannel};
use crate::db::InvoiceDb;
use crate::scheduler::JobKind;
use crate::types::Config;

pub struct EngineState {
    pub db: Mutex<InvoiceDb>,
    pub config: RwLock<Config>,
    pub drafting: Arc<dyn DraftingChannel>,
    pub notifier: Arc<dyn NotificationChannel>,
    pub mail: Arc<dyn MailChannel>,
    last_scheduled_runs: Mutex<HashMap<JobKind, DateTime<Utc>>>,
}

impl EngineState {
    pub fn new(
        db: InvoiceDb,
        config: Config,
        drafting: Arc<dyn DraftingChannel>,
        notifier: Arc<dyn NotificationChannel>,
        mail: Arc<dyn MailChannel>,
    ) -> Self {
        Self {
            db: Mutex::new(db),
            config: RwLock::new(config),
            drafting,
            notifier,
            mail,
            last_scheduled_runs: Mutex::new(HashMap::new()),
        }
    }

    /// When a job kind last ran on schedule, for missed-job detection.
    pub fn get_last_scheduled_run(&self, job: JobKind) -> Option<DateTime<Utc>> {
        self.last_scheduled_runs.lock().get(&job).copied()
    }

    pub fn set_last_scheduled_run(&self, job: JobKind, at: DateTime<Utc>) {
        self.last_scheduled_runs.lock().insert(job, at);
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::channels::mock::{MockDrafting, MockMail, MockNotifier};
    use crate::db::test_utils::test_db;

    pub struct TestHarness {
        pub state: Arc<EngineState>,
        pub drafting: Arc<MockDrafting>,
        pub notifier: Arc<MockNotifier>,
        pub mail: Arc<MockMail>,
    }

    /// Engine state wired to a temp database and recording mock channels.
    pub fn test_state() -> TestHarness {
        let drafting = Arc::new(MockDrafting::default());
        let notifier = Arc::new(MockNotifier::default());
        let mail = Arc::new(MockMail::default());
        let state = Arc::new(EngineState::new(
            test_db(),
            Config::default(),
            drafting.clone(),
            notifier.clone(),
            mail.clone(),
        ));
        TestHarness {
            state,
            drafting,
            notifier,
            mail,
        }
    }
}

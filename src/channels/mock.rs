//! In-crate channel mocks for unit tests. Each records the requests it
//! received and can be flipped into a failing mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChannelError, DraftRequest, DraftResponse, DraftingChannel, MailChannel,
    NotificationChannel, NotifyRequest, OutboundMail,
};

#[derive(Default)]
pub struct MockDrafting {
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<DraftRequest>>,
}

#[async_trait]
impl DraftingChannel for MockDrafting {
    async fn draft(&self, request: &DraftRequest) -> Result<DraftResponse, ChannelError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ChannelError::Transport("drafting unavailable".to_string()));
        }
        self.calls.lock().push(request.clone());
        Ok(DraftResponse {
            subject: format!(
                "Reminder: invoice {} ({})",
                request.summary.invoice_number.as_deref().unwrap_or("n/a"),
                request.tone.as_str()
            ),
            body: format!(
                "Hi {}, this is a {} reminder about {} {}.",
                request.summary.client_name,
                request.tone.as_str(),
                request.summary.amount_total,
                request.summary.currency
            ),
            confidence: 0.95,
        })
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub fail: AtomicBool,
    pub notifications: Mutex<Vec<NotifyRequest>>,
}

#[async_trait]
impl NotificationChannel for MockNotifier {
    async fn notify(&self, request: &NotifyRequest) -> Result<String, ChannelError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ChannelError::Status(503));
        }
        let mut notifications = self.notifications.lock();
        notifications.push(request.clone());
        Ok(format!("msg-{}", notifications.len()))
    }
}

#[derive(Default)]
pub struct MockMail {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<OutboundMail>>,
    deliveries: AtomicUsize,
}

#[async_trait]
impl MailChannel for MockMail {
    async fn send(&self, mail: &OutboundMail) -> Result<String, ChannelError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ChannelError::Transport("smtp relay down".to_string()));
        }
        self.sent.lock().push(mail.clone());
        let n = self.deliveries.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("dlv-{}", n))
    }
}

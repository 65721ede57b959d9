use crate::domain::ports::{NotificationKind, NotificationParams, Notifier, NotifyError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Writes every notification to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        email: &str,
        kind: NotificationKind,
        params: &NotificationParams,
    ) -> Result<(), NotifyError> {
        info!(
            to = email,
            template = kind.template(),
            booking = params.get("booking").map(String::as_str).unwrap_or("-"),
            "Notification dispatched"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub email: String,
    pub kind: NotificationKind,
    pub params: NotificationParams,
}

/// Keeps sent notifications in memory so tests can inspect them.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following delivery fail.
    pub fn fail_deliveries(&self, fail: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent().into_iter().map(|n| n.kind).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        email: &str,
        kind: NotificationKind,
        params: &NotificationParams,
    ) -> Result<(), NotifyError> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(NotifyError(format!("mailbox {email} unreachable")));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentNotification {
                email: email.to_string(),
                kind,
                params: params.clone(),
            });
        Ok(())
    }
}

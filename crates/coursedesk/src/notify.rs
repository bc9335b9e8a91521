//! Transient user-facing notifications.
//!
//! Every feature reports the outcome of a user action as a [`Toast`]. Toasts
//! are queued per session (drained by the page shell) and broadcast to any
//! live subscriber.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// How long a toast stays visible unless stated otherwise
pub const DEFAULT_TOAST_MS: u64 = 3000;

/// Display time for the last-resort error toast
pub const FATAL_TOAST_MS: u64 = 5000;

/// Message shown when an unclassified error reaches the page
pub const FATAL_MESSAGE: &str = "Something went wrong. Please refresh the page.";

const MAX_PENDING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    pub duration_ms: u64,
}

impl Toast {
    pub fn new(level: ToastLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            duration_ms: DEFAULT_TOAST_MS,
        }
    }
}

#[derive(Debug)]
pub struct Notifier {
    pending: Mutex<VecDeque<Toast>>,
    tx: broadcast::Sender<Toast>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MAX_PENDING);
        Self {
            pending: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    pub fn show(&self, toast: Toast) {
        debug!(level = ?toast.level, message = %toast.message, "toast");
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if pending.len() == MAX_PENDING {
                pending.pop_front();
            }
            pending.push_back(toast.clone());
        }
        // No subscribers is fine; the queue still holds it.
        let _ = self.tx.send(toast);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.show(Toast::new(ToastLevel::Info, message));
    }

    pub fn success(&self, message: impl Into<String>) {
        self.show(Toast::new(ToastLevel::Success, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.show(Toast::new(ToastLevel::Error, message));
    }

    /// The last-resort notification for errors nothing else handled.
    pub fn fatal(&self) {
        self.show(Toast {
            level: ToastLevel::Error,
            message: FATAL_MESSAGE.to_string(),
            duration_ms: FATAL_TOAST_MS,
        });
    }

    /// Take every queued toast, oldest first.
    pub fn drain(&self) -> Vec<Toast> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_in_order_and_empties() {
        let notifier = Notifier::new();
        notifier.success("one");
        notifier.error("two");

        let toasts = notifier.drain();
        assert_eq!(toasts.len(), 2);
        assert_eq!(toasts[0], Toast::new(ToastLevel::Success, "one"));
        assert_eq!(toasts[1].level, ToastLevel::Error);
        assert!(notifier.drain().is_empty());
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let notifier = Notifier::new();
        for i in 0..(MAX_PENDING + 5) {
            notifier.info(format!("toast {}", i));
        }
        let toasts = notifier.drain();
        assert_eq!(toasts.len(), MAX_PENDING);
        assert_eq!(toasts[0].message, "toast 5");
    }

    #[test]
    fn test_fatal_toast() {
        let notifier = Notifier::new();
        notifier.fatal();
        let toast = notifier.drain().remove(0);
        assert_eq!(toast.message, FATAL_MESSAGE);
        assert_eq!(toast.duration_ms, FATAL_TOAST_MS);
    }

    #[tokio::test]
    async fn test_subscribers_receive_toasts() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.info("hello");
        assert_eq!(rx.recv().await.unwrap().message, "hello");
    }
}

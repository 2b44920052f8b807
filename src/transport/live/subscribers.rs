use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::protocol::Notification;

/// Fan-out of session notifications. Each subscriber gets its own unbounded
/// queue, so one slow reader never reorders or drops another's events.
/// Dropping the receiver unsubscribes; the sender is pruned on the next publish.
#[derive(Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, notification: Notification) {
        self.lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Notification>>> {
        // A panic while holding this lock cannot leave the Vec half-updated.
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

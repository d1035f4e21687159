use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative cancellation signal, checked at every suspension point: before
/// a stage starts, before an agent invocation, before a retry sleep, before a
/// checkpoint write, and at every inter-stage boundary. Setting the flag
/// never interrupts in-flight work; it only changes what the next checked
/// point does.
#[derive(Default)]
pub struct CancellationToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { flag: AtomicBool::new(false), notify: Notify::new() }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called, for callers that want to race
    /// cancellation against other work (e.g. a stage timeout) rather than
    /// polling `is_cancelled`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

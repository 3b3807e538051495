//! One-shot latch for cross-task rendezvous.
//!
//! Recipes create a fresh latch per wait (barrier release, leader cycle
//! completion) and discard it afterwards. Releasing is idempotent.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;

/// A one-shot release latch.
#[derive(Debug, Default)]
pub struct Latch {
    released: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every current and future waiter. Idempotent.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Wait until released.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the flag check so a release between
            // the check and the await is not lost.
            notified.as_mut().enable();
            if self.is_released() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until released or the timeout elapses. `None` waits
    /// unboundedly. Returns `true` when released.
    pub async fn wait_with_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                self.wait().await;
                true
            }
            Some(limit) => tokio::time::timeout(limit, self.wait()).await.is_ok(),
        }
    }
}

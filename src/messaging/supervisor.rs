//! Reconnect scheduling
//!
//! Reconnection is a plain deferred task: a single tokio task sleeps for the
//! policy's delay, tries to re-establish the link, and repeats until it
//! succeeds, the attempt budget runs out, or shutdown begins. A `pending` flag
//! guarantees at most one such task per owner; the task handle is kept so
//! shutdown can abort a sleeping attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerError, ConnectionManager};

/// Owner of a supervised broker link (producer or consumer)
pub(crate) trait Supervised: Clone + Send + Sync + 'static {
    fn role(&self) -> &'static str;

    fn manager(&self) -> &ConnectionManager;

    fn scheduler(&self) -> &ReconnectScheduler;

    /// Re-open the connection and restore whatever the owner needs on it
    fn establish(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

#[derive(Default)]
pub(crate) struct ReconnectScheduler {
    pending: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectScheduler {
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Abort a scheduled attempt (shutdown path)
    pub(crate) fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.pending.store(false, Ordering::SeqCst);
    }
}

/// Schedule reconnection unless one is already pending or shutdown has begun
pub(crate) fn schedule_reconnect<S: Supervised>(target: &S) {
    if target.manager().state().is_shutting_down() {
        return;
    }
    let scheduler = target.scheduler();
    if scheduler.pending.swap(true, Ordering::SeqCst) {
        return;
    }
    let handle = tokio::spawn(reconnect_loop(target.clone()));
    *scheduler.task.lock() = Some(handle);
}

async fn reconnect_loop<S: Supervised>(target: S) {
    let role = target.role();
    let manager = target.manager();
    let state = manager.state();

    loop {
        let Some(delay) = manager.next_reconnect_delay() else {
            target.scheduler().pending.store(false, Ordering::SeqCst);
            if !state.is_shutting_down() {
                warn!(
                    role,
                    attempts = state.reconnect_attempts(),
                    "Reconnect attempts exhausted, giving up"
                );
            }
            return;
        };

        info!(
            role,
            attempt = state.reconnect_attempts(),
            max_attempts = ?manager.policy().max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        tokio::time::sleep(delay).await;

        if state.is_shutting_down() {
            target.scheduler().pending.store(false, Ordering::SeqCst);
            return;
        }

        if let Err(e) = target.establish().await {
            warn!(role, error = %e, "Reconnection failed");
            continue;
        }

        target.scheduler().pending.store(false, Ordering::SeqCst);
        if state.is_connected() || state.is_shutting_down() {
            info!(role, "Reconnected");
            return;
        }
        // Lost again before the flag was released; keep going unless another task took over
        if target.scheduler().pending.swap(true, Ordering::SeqCst) {
            return;
        }
    }
}

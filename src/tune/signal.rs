//! Cooperative stop signal shared by a session and everything it waits on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Latching stop flag backed by a [`watch`] channel.
///
/// Clones observe the same flag. Once requested it stays raised until
/// [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal, waking every waiter.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    /// Lower the signal.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether the signal is currently raised.
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

/// Sleep for `duration` unless `stop` is raised first.
///
/// Returns `true` if the full duration elapsed, `false` if interrupted.
pub async fn sleep_or_stop(duration: Duration, stop: &StopSignal) -> bool {
    if stop.is_requested() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.requested() => false,
    }
}

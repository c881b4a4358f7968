use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Thread-safe lifecycle state shared by every startable component.
///
/// Tracks the running flag, the stop-in-progress flag, and a one-shot
/// completion signal that `wait_for_stop` blocks on. The signal is installed
/// by [`prepare_stop`](Self::prepare_stop) and fulfilled exactly once per
/// running→stopped cycle by [`mark_stopped`](Self::mark_stopped).
#[derive(Debug, Default)]
pub struct LifecycleManager {
    running: AtomicBool,
    stop_initiated: AtomicBool,
    signal: Mutex<Option<(watch::Sender<bool>, watch::Receiver<bool>)>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Attempts the stopped→running transition. Only one caller can win.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally marks the component running.
    pub fn set_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Marks the component stopped, fulfils the stop signal if one was
    /// installed, and clears the stop-initiated flag.
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
        if let Some((tx, _rx)) = self.signal.lock().take() {
            let _ = tx.send(true);
        }
        self.stop_initiated.store(false, Ordering::Release);
    }

    /// Waits until a stop in progress completes. Returns immediately when no
    /// stop is in progress.
    pub async fn wait_for_stop(&self) {
        let rx = self.signal.lock().as_ref().map(|(_tx, rx)| rx.clone());
        if let Some(mut rx) = rx {
            // The sender side may already be gone; that also means stopped.
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    pub fn is_stop_initiated(&self) -> bool {
        self.stop_initiated.load(Ordering::Acquire)
    }

    /// Claims the stop operation. Returns true when the caller should proceed
    /// with stop logic; false when a stop is already in progress or the
    /// component is not running.
    pub fn prepare_stop(&self) -> bool {
        if self
            .stop_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if !self.running.load(Ordering::Acquire) {
            self.stop_initiated.store(false, Ordering::Release);
            return false;
        }

        *self.signal.lock() = Some(watch::channel(false));
        true
    }

    pub fn clear_stop_initiated(&self) {
        self.stop_initiated.store(false, Ordering::Release);
    }

    /// Forces the manager back to its initial state.
    pub fn reset(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_initiated.store(false, Ordering::Release);
        *self.signal.lock() = None;
    }
}

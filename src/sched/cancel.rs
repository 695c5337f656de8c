use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation handle scoped to a single scheduling run.
///
/// Cancelled either in-process (`cancel`) or by another process dropping an
/// abort marker file next to the run lock.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same cancellation flag, additionally watching `marker`.
    pub fn watching(&self, marker: PathBuf) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            marker: Some(marker),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.marker {
            Some(marker) if marker.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Sleep for up to `duration`, waking early on cancellation.
    /// Returns `false` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

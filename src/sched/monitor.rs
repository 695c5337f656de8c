use crate::sched::cancel::CancelToken;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// In-process single-flight state, one slot per conversation.
#[derive(Debug, Default)]
pub struct RunRegistry {
    slots: Mutex<HashMap<String, CancelToken>>,
}

impl RunRegistry {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the conversation, or `None` if a run is already in flight.
    /// A trigger that loses the race is dropped, not queued.
    pub fn try_begin(&self, conversation: &str) -> Option<RunGuard<'_>> {
        let mut slots = self.slots();
        if slots.contains_key(conversation) {
            return None;
        }
        let token = CancelToken::new();
        slots.insert(conversation.to_string(), token.clone());
        Some(RunGuard {
            registry: self,
            conversation: conversation.to_string(),
            token,
            marker: None,
        })
    }

    pub fn is_running(&self, conversation: &str) -> bool {
        self.slots().contains_key(conversation)
    }

    /// Cancels the in-flight run for `conversation`; false when idle.
    pub fn abort(&self, conversation: &str) -> bool {
        match self.slots().get(conversation) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) -> usize {
        let slots = self.slots();
        for token in slots.values() {
            token.cancel();
        }
        slots.len()
    }
}

/// Held for the duration of one run; releases the slot however the run ends.
#[derive(Debug)]
pub struct RunGuard<'a> {
    registry: &'a RunRegistry,
    conversation: String,
    token: CancelToken,
    marker: Option<PathBuf>,
}

impl RunGuard<'_> {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Also honour an abort marker file. A marker naming another run is stale
    /// and cleared so it cannot cancel this one; one naming `run_id` was
    /// written after this run took its lock and is kept.
    pub fn watch_marker(&mut self, marker: PathBuf, run_id: &str) {
        let targets_this_run = fs::read_to_string(&marker)
            .map(|raw| raw.trim() == run_id)
            .unwrap_or(false);
        if !targets_this_run {
            let _ = fs::remove_file(&marker);
        }
        self.token = self.token.watching(marker.clone());
        self.marker = Some(marker);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.slots().remove(&self.conversation);
        if let Some(marker) = &self.marker {
            let _ = fs::remove_file(marker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RunRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn second_begin_is_refused_while_running() {
        let registry = RunRegistry::default();
        let guard = registry.try_begin("c1").expect("first");
        assert!(registry.try_begin("c1").is_none());
        assert!(registry.try_begin("c2").is_some(), "conversations are independent");
        assert!(registry.is_running("c1"));
        drop(guard);
        assert!(!registry.is_running("c1"));
        assert!(registry.try_begin("c1").is_some());
    }

    #[test]
    fn slot_is_released_when_run_panics() {
        let registry = Arc::new(RunRegistry::default());
        let inner = Arc::clone(&registry);
        let result = thread::spawn(move || {
            let _guard = inner.try_begin("c1").expect("begin");
            panic!("summarizer blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!registry.is_running("c1"));
    }

    #[test]
    fn concurrent_triggers_yield_one_run() {
        let registry = Arc::new(RunRegistry::default());
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));
        let hold = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let hold = Arc::clone(&hold);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    barrier.wait();
                    let guard = registry.try_begin("c1");
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Keep the winner's guard alive until everyone has tried.
                    hold.wait();
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_reaches_the_running_token_only() {
        let registry = RunRegistry::default();
        assert!(!registry.abort("c1"));
        let guard = registry.try_begin("c1").expect("begin");
        let other = registry.try_begin("c2").expect("begin");
        assert!(registry.abort("c1"));
        assert!(guard.token().is_cancelled());
        assert!(!other.token().is_cancelled());
        drop(guard);
        let next = registry.try_begin("c1").expect("begin");
        assert!(!next.token().is_cancelled(), "abort never leaks into a later run");
    }

    #[test]
    fn marker_is_cleared_before_and_after_run() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("c1.abort");
        std::fs::write(&marker, "older-run\n").expect("stale marker");
        let registry = RunRegistry::default();
        let mut guard = registry.try_begin("c1").expect("begin");
        guard.watch_marker(marker.clone(), "this-run");
        assert!(!guard.token().is_cancelled());
        std::fs::write(&marker, "").expect("abort marker");
        assert!(guard.token().is_cancelled());
        drop(guard);
        assert!(!marker.exists());
    }

    #[test]
    fn abort_written_before_watching_still_cancels() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("c1.abort");
        // The abort landed between taking the run lock and watching the marker.
        std::fs::write(&marker, "this-run\n").expect("abort marker");
        let registry = RunRegistry::default();
        let mut guard = registry.try_begin("c1").expect("begin");
        guard.watch_marker(marker.clone(), "this-run");
        assert!(guard.token().is_cancelled());
        drop(guard);
        assert!(!marker.exists());
    }
}

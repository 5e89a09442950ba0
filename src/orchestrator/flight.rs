// ABOUTME: Single-flight busy flags keyed by task, released by an RAII guard
// ABOUTME: A key that is already running makes later attempts skip rather than queue

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of task keys currently executing, behind one mutex.
#[derive(Debug, Clone, Default)]
pub struct BusyFlags {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl BusyFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `key`; `None` when a previous run still holds it.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        if !self.lock().insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard {
            flags: self.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn busy_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Holds a busy flag until dropped, including on error or panic unwinding.
#[derive(Debug)]
pub struct FlightGuard {
    flags: BusyFlags,
    key: String,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flags.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused_until_release() {
        let flags = BusyFlags::new();
        let guard = flags.try_acquire("LeaderToFollower_orders").unwrap();
        assert!(flags.is_busy("LeaderToFollower_orders"));
        assert!(flags.try_acquire("LeaderToFollower_orders").is_none());
        // Other keys are independent.
        assert!(flags.try_acquire("FollowerToLeader_orders").is_some());

        drop(guard);
        assert!(!flags.is_busy("LeaderToFollower_orders"));
        assert!(flags.try_acquire("LeaderToFollower_orders").is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let flags = BusyFlags::new();
        let cloned = flags.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_acquire("cleanup").unwrap();
            panic!("tick blew up");
        });
        assert!(result.is_err());
        assert!(!flags.is_busy("cleanup"));
    }

    #[test]
    fn test_busy_keys_sorted() {
        let flags = BusyFlags::new();
        let _b = flags.try_acquire("b").unwrap();
        let _a = flags.try_acquire("a").unwrap();
        assert_eq!(flags.busy_keys(), vec!["a", "b"]);
        flags.clear();
        assert!(flags.busy_keys().is_empty());
    }
}

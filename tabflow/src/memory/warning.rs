//! Low-memory signal source.
//!
//! External code that watches actual memory usage reports `(used, max)`
//! observations here; once usage crosses the configured threshold fraction,
//! every registered listener is notified. Listeners are held weakly so the
//! warning system never extends their lifetime.

use std::sync::{Arc, Mutex, Weak};

/// Default fraction of the maximum memory that counts as "low".
const DEFAULT_USAGE_THRESHOLD: f64 = 0.7;

/// Receives low-memory notifications with the observed usage.
pub trait MemoryAlertListener: Send + Sync {
    fn memory_usage_low(&self, used_bytes: u64, max_bytes: u64);
}

/// Fans low-memory observations out to weakly-held listeners.
pub struct MemoryWarningSystem {
    threshold: f64,
    listeners: Mutex<Vec<Weak<dyn MemoryAlertListener>>>,
}

impl MemoryWarningSystem {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_USAGE_THRESHOLD)
    }

    /// Creates a warning system that fires once `used >= threshold * max`.
    pub fn with_threshold(threshold: f64) -> Self {
        MemoryWarningSystem {
            threshold: threshold.clamp(0.0, 1.0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn usage_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn register_listener<T: MemoryAlertListener + 'static>(&self, listener: &Arc<T>) {
        let erased: Arc<dyn MemoryAlertListener> = listener.clone();
        let weak: Weak<dyn MemoryAlertListener> = Arc::downgrade(&erased);
        self.lock_listeners().push(weak);
    }

    /// Number of listeners still alive; dead ones are pruned.
    pub fn listener_count(&self) -> usize {
        let mut listeners = self.lock_listeners();
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.len()
    }

    /// Feeds one memory-usage observation. Fires all live listeners when the
    /// threshold is reached; callbacks run outside the listener lock.
    pub fn report_usage(&self, used_bytes: u64, max_bytes: u64) {
        if (used_bytes as f64) < self.threshold * max_bytes as f64 {
            return;
        }
        let live: Vec<Arc<dyn MemoryAlertListener>> = {
            let mut listeners = self.lock_listeners();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        log::debug!(
            "memory usage {} of {} bytes crossed threshold, notifying {} listeners",
            used_bytes,
            max_bytes,
            live.len()
        );
        for listener in live {
            listener.memory_usage_low(used_bytes, max_bytes);
        }
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<Weak<dyn MemoryAlertListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|_| panic!("listener lock poisoned"))
    }
}

impl Default for MemoryWarningSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl MemoryAlertListener for Counting {
        fn memory_usage_low(&self, _used_bytes: u64, _max_bytes: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fires_only_at_threshold() {
        let system = MemoryWarningSystem::with_threshold(0.7);
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        system.register_listener(&listener);

        system.report_usage(500, 1000);
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);

        system.report_usage(700, 1000);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        system.report_usage(999, 1000);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dead_listeners_are_dropped() {
        let system = MemoryWarningSystem::new();
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        system.register_listener(&listener);
        assert_eq!(system.listener_count(), 1);

        drop(listener);

        assert_eq!(system.listener_count(), 0);
        // reporting over an empty listener set is harmless
        system.report_usage(1000, 1000);
    }

    #[test]
    fn test_threshold_is_clamped() {
        assert_eq!(MemoryWarningSystem::with_threshold(1.7).usage_threshold(), 1.0);
        assert_eq!(MemoryWarningSystem::with_threshold(-0.2).usage_threshold(), 0.0);
    }
}

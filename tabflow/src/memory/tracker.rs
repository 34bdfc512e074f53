//! Weakly-referencing registry of releasable objects with LRU eviction.
//!
//! Responsibilities:
//! - Track registered objects together with a monotonic last-access stamp
//!   and the owner context they were registered under.
//! - On a low-memory signal, release objects in least-recently-used order
//!   until the configured strategy's target is met.
//!
//! One coarse lock guards registration, unregistration, promotion and the
//! snapshot step of a sweep; the eviction callbacks themselves run outside
//! that lock, so an object registered mid-sweep is simply not part of that
//! sweep. The sweep runs on a freshly spawned thread so delivery of the
//! low-memory signal is never blocked by eviction work; tests inject
//! [`SweepMode::Synchronous`] instead.

use super::{EvictionStrategy, MemoryAlertListener, Releasable};
use crate::context::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Whether a low-memory signal runs its sweep on a dedicated thread or
/// inline on the calling thread (tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Background,
    Synchronous,
}

struct TrackedEntry {
    object: Weak<dyn Releasable>,
    last_access: u64,
    owner: Option<NodeId>,
}

struct TrackerInner {
    entries: HashMap<usize, TrackedEntry>,
    next_stamp: u64,
}

struct SweepCandidate {
    key: usize,
    object: Weak<dyn Releasable>,
    last_access: u64,
    owner: Option<NodeId>,
}

/// Registry of releasable objects, evicted coldest-first under memory
/// pressure. Explicitly constructed; create one per process and share it
/// behind an `Arc`.
pub struct MemoryTracker {
    inner: Arc<Mutex<TrackerInner>>,
    strategy: EvictionStrategy,
    mode: SweepMode,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::with_config(EvictionStrategy::FreeAll, SweepMode::Background)
    }

    pub fn with_config(strategy: EvictionStrategy, mode: SweepMode) -> Self {
        MemoryTracker {
            inner: Arc::new(Mutex::new(TrackerInner {
                entries: HashMap::new(),
                next_stamp: 0,
            })),
            strategy,
            mode,
        }
    }

    /// Starts tracking `object` under `owner`. The object is held weakly and
    /// stamped with a fresh access time.
    pub fn register<T: Releasable + 'static>(&self, object: &Arc<T>, owner: Option<NodeId>) {
        let mut inner = lock_registry(&self.inner);
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        let erased: Arc<dyn Releasable> = object.clone();
        let weak: Weak<dyn Releasable> = Arc::downgrade(&erased);
        inner.entries.insert(
            key_of(object),
            TrackedEntry {
                object: weak,
                last_access: stamp,
                owner,
            },
        );
        log::debug!("tracking releasable object ({} in total)", inner.entries.len());
    }

    /// Stops tracking `object`. Untracked objects are logged, not an error.
    pub fn unregister<T: Releasable + 'static>(&self, object: &Arc<T>) {
        let mut inner = lock_registry(&self.inner);
        if inner.entries.remove(&key_of(object)).is_none() {
            log::debug!("attempted to untrack an object that was not tracked");
        } else {
            log::debug!(
                "untracked releasable object ({} remaining)",
                inner.entries.len()
            );
        }
    }

    /// Refreshes the access stamp of `object`, protecting it from near-term
    /// eviction. No-op if the object is not tracked.
    pub fn promote<T: Releasable + 'static>(&self, object: &Arc<T>) {
        let mut guard = lock_registry(&self.inner);
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(&key_of(object)) {
            entry.last_access = inner.next_stamp;
            inner.next_stamp += 1;
        }
    }

    /// Number of live tracked entries. Entries whose object has been dropped
    /// elsewhere are pruned first.
    pub fn tracked_count(&self) -> usize {
        let mut inner = lock_registry(&self.inner);
        inner.entries.retain(|_, entry| entry.object.strong_count() > 0);
        inner.entries.len()
    }

    /// Entry point for the external memory-pressure signal. Picks the
    /// strategy's target and runs the sweep according to the configured
    /// [`SweepMode`].
    pub fn on_low_memory(&self, used_bytes: u64, max_bytes: u64) {
        log::debug!(
            "low memory encountered, used {} of {} bytes",
            used_bytes,
            max_bytes
        );
        let fraction = self.strategy.target_fraction();
        match self.mode {
            SweepMode::Background => {
                let registry = Arc::clone(&self.inner);
                let spawned = thread::Builder::new()
                    .name("tabflow-memory-sweeper".to_string())
                    .spawn(move || sweep_registry(&registry, fraction));
                if let Err(e) = spawned {
                    log::error!("failed to spawn eviction thread: {}", e);
                }
            }
            SweepMode::Synchronous => sweep_registry(&self.inner, fraction),
        }
    }

    /// Drives one sweep synchronously on the calling thread, bypassing the
    /// signal path and the thread hop. Intended for tests.
    pub fn simulate_low_memory(&self) {
        sweep_registry(&self.inner, self.strategy.target_fraction());
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAlertListener for MemoryTracker {
    fn memory_usage_low(&self, used_bytes: u64, max_bytes: u64) {
        self.on_low_memory(used_bytes, max_bytes);
    }
}

fn key_of<T: Releasable + 'static>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

fn lock_registry(inner: &Mutex<TrackerInner>) -> std::sync::MutexGuard<'_, TrackerInner> {
    inner
        .lock()
        .unwrap_or_else(|_| panic!("tracker registry lock poisoned"))
}

/// One eviction pass: snapshot under the lock, sort ascending by access
/// stamp, then ask each candidate to release outside the lock until the
/// target fraction of the starting population has been released.
fn sweep_registry(inner: &Mutex<TrackerInner>, fraction: f64) {
    let mut snapshot: Vec<SweepCandidate> = {
        let mut guard = lock_registry(inner);
        guard.entries.retain(|_, entry| entry.object.strong_count() > 0);
        guard
            .entries
            .iter()
            .map(|(&key, entry)| SweepCandidate {
                key,
                object: entry.object.clone(),
                last_access: entry.last_access,
                owner: entry.owner.clone(),
            })
            .collect()
    };
    let initial = snapshot.len();
    if initial == 0 {
        return;
    }
    snapshot.sort_by_key(|candidate| candidate.last_access);
    // stamps come from one counter under the registry lock
    debug_assert!(
        snapshot
            .windows(2)
            .all(|pair| pair[0].last_access != pair[1].last_access),
        "equal access stamps in eviction sweep"
    );

    log::debug!("trying to release {} tracked objects", initial);
    let mut released = 0usize;
    for candidate in &snapshot {
        if let Some(object) = candidate.object.upgrade() {
            let agreed = match object.memory_alert(candidate.owner.as_ref()) {
                Ok(flag) => flag,
                Err(e) => {
                    log::error!("error while alerting low memory condition: {}", e);
                    true
                }
            };
            if agreed {
                let mut guard = lock_registry(inner);
                guard.entries.remove(&candidate.key);
                released += 1;
            }
        }
        if released as f64 / initial as f64 >= fraction {
            break;
        }
    }
    let remaining = lock_registry(inner).entries.len();
    log::debug!(
        "{}/{} tracked objects have been released ({} remaining)",
        released,
        initial,
        remaining
    );
}

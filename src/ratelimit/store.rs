//! Fixed-window counter store.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};

/// One caller's current counting window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window began
    pub window_start: DateTime<Utc>,
    /// When the current window ends; the entry is stale from then on
    pub reset_at: DateTime<Utc>,
}

impl WindowEntry {
    fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            reset_at: window_end(now, window),
        }
    }

    fn snapshot(&self) -> WindowCount {
        WindowCount {
            count: self.count,
            reset_at: self.reset_at,
        }
    }
}

/// The counter state right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Post-increment count
    pub count: u64,
    /// End of the window the count belongs to
    pub reset_at: DateTime<Utc>,
}

/// In-memory keyed counter store with expiring windows.
///
/// Each key is updated under its dashmap shard lock, so concurrent
/// increments of the same key never lose an update or open two windows.
pub struct WindowStore {
    entries: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl WindowStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// The store's current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Count one request for `key`, opening a new window when there is none
    /// or the previous one has ended.
    pub fn increment(&self, key: &str, window: Duration) -> WindowCount {
        let now = self.clock.now();

        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now >= entry.reset_at {
                    *entry = WindowEntry::open(now, window);
                    trace!(key = %key, reset_at = %entry.reset_at, "Window expired, reopened");
                } else {
                    entry.count += 1;
                }
                entry.snapshot()
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(WindowEntry::open(now, window));
                debug!(key = %key, reset_at = %entry.reset_at, "Opened new window");
                entry.snapshot()
            }
        }
    }

    /// Take one request back out of the window ending at `reset_at`.
    ///
    /// Does nothing if that window has since been replaced or removed, and
    /// never goes below zero. `reset_at` is left as it is.
    pub fn decrement(&self, key: &str, reset_at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.reset_at == reset_at && entry.count > 0 => {
                entry.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Forget the window for `key`.
    pub fn reset_key(&self, key: &str) {
        self.entries.remove(key);
    }

    /// A copy of the entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<WindowEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Number of tracked keys, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry whose window ended more than `max_age` ago.
    ///
    /// A zero `max_age` removes every entry, live or not.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        if max_age.is_zero() {
            self.entries.clear();
        } else {
            let cutoff = cutoff_before(self.clock.now(), max_age);
            self.entries.retain(|_, entry| entry.reset_at >= cutoff);
        }
        let removed = before.saturating_sub(self.entries.len());
        trace!(removed, "Cleanup finished");
        removed
    }

    /// Remove every entry whose window has ended.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.reset_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Evicted expired windows");
        }
        removed
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference and ends once the store is
    /// dropped. Returns `false` when no sweep could be started.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> bool {
        if period.is_zero() {
            warn!("Sweep period must be non-zero; sweep not started");
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No tokio runtime available; sweep not started");
                return false;
            }
        };

        let store = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.evict_expired();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
        info!(period_ms = period.as_millis() as u64, "Window sweep started");
        true
    }

    /// Whether a sweep task is currently attached.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the sweep and drop all entries. Safe to call more than once; the
    /// store keeps working afterwards.
    pub fn destroy(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.entries.clear();
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WindowStore {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

fn window_end(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| start.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

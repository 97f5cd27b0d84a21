//! Sliding-window rate limiting with periodic memory reclamation.
//!
//! Request timestamps live in a [`RateLimitStore`], which several limiters
//! may share. Each key remembers the window it was last used with so the
//! store-wide cleanup sweep can prune it correctly.

use crate::{MaskingError, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Lower bound for the cleanup interval (seconds).
pub const MIN_CLEANUP_INTERVAL_SECS: i64 = 60;
/// Upper bound for the cleanup interval (one week).
pub const MAX_CLEANUP_INTERVAL_SECS: i64 = 604_800;
/// Default cleanup interval (seconds).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: i64 = 300;
/// Longest accepted rate-limit key, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;
/// Largest accepted `max_requests`.
pub const MAX_REQUESTS_LIMIT: usize = 1_000_000;
/// Largest accepted window (one day).
pub const MAX_WINDOW_SECS: i64 = 86_400;

// Rough per-key bookkeeping overhead used for memory estimates.
const KEY_OVERHEAD_BYTES: usize = 64;

/// Source of the current time in unix seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock fixed at `start` until moved.
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct KeyWindow {
    window_secs: i64,
    stamps: VecDeque<i64>,
}

impl KeyWindow {
    fn prune(&mut self, now: i64) {
        let cutoff = now - self.window_secs;
        while self.stamps.front().is_some_and(|&t| t < cutoff) {
            self.stamps.pop_front();
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    keys: HashMap<String, KeyWindow>,
    last_cleanup: i64,
    cleanup_interval: i64,
}

impl StoreInner {
    fn maybe_cleanup(&mut self, now: i64) {
        if now - self.last_cleanup < self.cleanup_interval {
            return;
        }
        let removed = self.sweep(now);
        debug!(removed, remaining = self.keys.len(), "Rate limit cleanup sweep");
    }

    fn sweep(&mut self, now: i64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, kw| {
            kw.prune(now);
            !kw.stamps.is_empty()
        });
        self.last_cleanup = now;
        before - self.keys.len()
    }
}

/// Memory usage of a rate-limit store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Keys with at least one recorded timestamp.
    pub total_keys: usize,
    /// Timestamps held across all keys.
    pub total_timestamps: usize,
    /// Rough heap footprint of keys and timestamps.
    pub estimated_memory_bytes: usize,
    /// Unix seconds of the last cleanup sweep.
    pub last_cleanup: i64,
    /// Seconds between cleanup sweeps.
    pub cleanup_interval: i64,
}

/// Per-key limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Requests recorded in the current window.
    pub current: usize,
    /// Requests still admitted in the current window.
    pub remaining: usize,
    /// Seconds until the oldest recorded request leaves the window.
    pub time_until_reset: i64,
}

static GLOBAL_STORE: Lazy<Arc<RateLimitStore>> = Lazy::new(|| Arc::new(RateLimitStore::new()));

/// Shared per-key timestamp storage.
#[derive(Debug)]
pub struct RateLimitStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore {
    /// Store backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store backed by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(StoreInner {
                keys: HashMap::new(),
                last_cleanup: now,
                cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            }),
            clock,
        }
    }

    /// Process-wide store for callers that want limits shared across
    /// independently constructed limiters.
    pub fn global() -> Arc<RateLimitStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    /// Current time from the store's clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change how often the store-wide sweep runs.
    pub fn set_cleanup_interval(&self, secs: i64) -> Result<()> {
        if !(MIN_CLEANUP_INTERVAL_SECS..=MAX_CLEANUP_INTERVAL_SECS).contains(&secs) {
            return Err(MaskingError::InvalidRateLimitConfiguration(format!(
                "cleanup interval must be between {} and {} seconds, got {}",
                MIN_CLEANUP_INTERVAL_SECS, MAX_CLEANUP_INTERVAL_SECS, secs
            )));
        }
        self.lock().cleanup_interval = secs;
        Ok(())
    }

    /// Seconds between store-wide sweeps.
    pub fn cleanup_interval(&self) -> i64 {
        self.lock().cleanup_interval
    }

    /// Run the sweep immediately. Returns the number of keys removed.
    pub fn cleanup_now(&self) -> usize {
        let now = self.now();
        self.lock().sweep(now)
    }

    /// Key and timestamp counts with an estimated footprint.
    pub fn memory_stats(&self) -> MemoryStats {
        let inner = self.lock();
        let total_timestamps = inner.keys.values().map(|kw| kw.stamps.len()).sum();
        let estimated_memory_bytes = inner
            .keys
            .iter()
            .map(|(k, kw)| k.len() + kw.stamps.len() * std::mem::size_of::<i64>() + KEY_OVERHEAD_BYTES)
            .sum();
        MemoryStats {
            total_keys: inner.keys.len(),
            total_timestamps,
            estimated_memory_bytes,
            last_cleanup: inner.last_cleanup,
            cleanup_interval: inner.cleanup_interval,
        }
    }

    /// Drop every key.
    pub fn clear_all(&self) {
        self.lock().keys.clear();
    }

    /// Drop one key and its timestamps.
    pub fn clear_key(&self, key: &str) {
        self.lock().keys.remove(key);
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MaskingError::InvalidRateLimitConfiguration(
            "rate limit key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(MaskingError::InvalidRateLimitConfiguration(format!(
            "rate limit key exceeds {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(MaskingError::InvalidRateLimitConfiguration(
            "rate limit key must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Sliding-window limiter: at most `max_requests` per key within the
/// trailing `window_secs`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window_secs: i64,
    store: Arc<RateLimitStore>,
}

impl RateLimiter {
    /// Limiter with its own store and the system clock.
    pub fn new(max_requests: usize, window_secs: i64) -> Result<Self> {
        Self::with_store(max_requests, window_secs, Arc::new(RateLimitStore::new()))
    }

    /// Limiter over an existing (possibly shared) store.
    pub fn with_store(
        max_requests: usize,
        window_secs: i64,
        store: Arc<RateLimitStore>,
    ) -> Result<Self> {
        if !(1..=MAX_REQUESTS_LIMIT).contains(&max_requests) {
            return Err(MaskingError::InvalidRateLimitConfiguration(format!(
                "max_requests must be between 1 and {}, got {}",
                MAX_REQUESTS_LIMIT, max_requests
            )));
        }
        if !(1..=MAX_WINDOW_SECS).contains(&window_secs) {
            return Err(MaskingError::InvalidRateLimitConfiguration(format!(
                "window must be between 1 and {} seconds, got {}",
                MAX_WINDOW_SECS, window_secs
            )));
        }
        Ok(Self {
            max_requests,
            window_secs,
            store,
        })
    }

    /// Requests admitted per window and key.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Sliding window length in seconds.
    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    /// Record a request for `key` if it is within the limit.
    pub fn is_allowed(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let now = self.store.now();
        let mut inner = self.store.lock();
        inner.maybe_cleanup(now);

        let kw = inner.keys.entry(key.to_string()).or_insert_with(|| KeyWindow {
            window_secs: self.window_secs,
            stamps: VecDeque::new(),
        });
        kw.window_secs = self.window_secs;
        kw.prune(now);

        if kw.stamps.len() < self.max_requests {
            kw.stamps.push_back(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current count within the window, without recording a request.
    fn current(&self, key: &str, now: i64) -> (usize, Option<i64>) {
        let mut inner = self.store.lock();
        match inner.keys.get_mut(key) {
            Some(kw) => {
                kw.window_secs = self.window_secs;
                kw.prune(now);
                (kw.stamps.len(), kw.stamps.front().copied())
            }
            None => (0, None),
        }
    }

    /// Requests `key` may still make in the current window.
    pub fn remaining_requests(&self, key: &str) -> Result<usize> {
        validate_key(key)?;
        let (current, _) = self.current(key, self.store.now());
        Ok(self.max_requests.saturating_sub(current))
    }

    /// Seconds until the oldest request in the window expires.
    pub fn time_until_reset(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        let now = self.store.now();
        let (_, oldest) = self.current(key, now);
        Ok(oldest.map_or(0, |t| (t + self.window_secs - now).max(0)))
    }

    /// Current count, remaining budget and reset time for `key`.
    pub fn stats(&self, key: &str) -> Result<RateLimitStats> {
        validate_key(key)?;
        let now = self.store.now();
        let (current, oldest) = self.current(key, now);
        Ok(RateLimitStats {
            current,
            remaining: self.max_requests.saturating_sub(current),
            time_until_reset: oldest.map_or(0, |t| (t + self.window_secs - now).max(0)),
        })
    }

    /// Memory usage of the underlying store.
    pub fn memory_stats(&self) -> MemoryStats {
        self.store.memory_stats()
    }

    /// Drop every key in the underlying store, including other limiters' keys.
    pub fn clear_all(&self) {
        self.store.clear_all();
    }

    /// Forget the recorded requests of `key`.
    pub fn clear_key(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.store.clear_key(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window: i64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(RateLimitStore::with_clock(clock.clone()));
        (RateLimiter::with_store(max, window, store).unwrap(), clock)
    }

    #[test]
    fn test_allows_up_to_max() {
        let (rl, _) = limiter(3, 60);
        assert!(rl.is_allowed("k").unwrap());
        assert!(rl.is_allowed("k").unwrap());
        assert!(rl.is_allowed("k").unwrap());
        assert!(!rl.is_allowed("k").unwrap());
    }

    #[test]
    fn test_window_slides() {
        let (rl, clock) = limiter(2, 60);
        assert!(rl.is_allowed("k").unwrap());
        clock.advance(30);
        assert!(rl.is_allowed("k").unwrap());
        assert!(!rl.is_allowed("k").unwrap());

        // First request falls out of the window.
        clock.advance(31);
        assert!(rl.is_allowed("k").unwrap());
        assert!(!rl.is_allowed("k").unwrap());
    }

    #[test]
    fn test_keys_are_independent() {
        let (rl, _) = limiter(1, 60);
        assert!(rl.is_allowed("a").unwrap());
        assert!(rl.is_allowed("b").unwrap());
        assert!(!rl.is_allowed("a").unwrap());
    }

    #[test]
    fn test_stats_and_reset_time() {
        let (rl, clock) = limiter(5, 60);
        rl.is_allowed("k").unwrap();
        clock.advance(10);
        rl.is_allowed("k").unwrap();

        let stats = rl.stats("k").unwrap();
        assert_eq!(stats.current, 2);
        assert_eq!(stats.remaining, 3);
        assert_eq!(stats.time_until_reset, 50);
        assert_eq!(rl.remaining_requests("unknown").unwrap(), 5);
        assert_eq!(rl.time_until_reset("unknown").unwrap(), 0);
    }

    #[test]
    fn test_invalid_keys() {
        let (rl, _) = limiter(5, 60);
        assert!(rl.is_allowed("").is_err());
        assert!(rl.is_allowed("bad\nkey").is_err());
        assert!(rl.is_allowed(&"x".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(rl.is_allowed(&"x".repeat(MAX_KEY_LENGTH)).is_ok());
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(RateLimiter::new(0, 60).is_err());
        assert!(RateLimiter::new(10, 0).is_err());
        assert!(RateLimiter::new(10, MAX_WINDOW_SECS + 1).is_err());
        assert!(RateLimiter::new(MAX_REQUESTS_LIMIT + 1, 60).is_err());
    }

    #[test]
    fn test_cleanup_interval_bounds() {
        let store = RateLimitStore::new();
        assert!(store.set_cleanup_interval(59).is_err());
        assert!(store.set_cleanup_interval(MAX_CLEANUP_INTERVAL_SECS + 1).is_err());
        store.set_cleanup_interval(120).unwrap();
        assert_eq!(store.cleanup_interval(), 120);
    }

    #[test]
    fn test_periodic_cleanup_removes_stale_keys() {
        let (rl, clock) = limiter(5, 60);
        rl.store().set_cleanup_interval(60).unwrap();
        for i in 0..10 {
            rl.is_allowed(&format!("key-{i}")).unwrap();
        }
        assert_eq!(rl.memory_stats().total_keys, 10);

        // Everything expires, next call triggers the sweep.
        clock.advance(120);
        rl.is_allowed("fresh").unwrap();
        let stats = rl.memory_stats();
        assert_eq!(stats.total_keys, 1);
        assert_eq!(stats.total_timestamps, 1);
        assert_eq!(stats.last_cleanup, 1_120);
    }

    #[test]
    fn test_clear() {
        let (rl, _) = limiter(1, 60);
        rl.is_allowed("a").unwrap();
        rl.is_allowed("b").unwrap();
        rl.clear_key("a").unwrap();
        assert!(rl.is_allowed("a").unwrap());
        rl.clear_all();
        assert_eq!(rl.memory_stats().total_keys, 0);
        assert!(rl.is_allowed("b").unwrap());
    }

    #[test]
    fn test_memory_estimate_grows() {
        let (rl, _) = limiter(10, 60);
        let empty = rl.memory_stats().estimated_memory_bytes;
        rl.is_allowed("k").unwrap();
        assert!(rl.memory_stats().estimated_memory_bytes > empty);
    }
}

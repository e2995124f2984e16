//! Small shared helpers: UUIDs, string sets, version compares, backoff loops

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Generate a fresh random identifier, hex-encoded.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Convert a slice of (perhaps duplicated) strings into a set.
pub fn strings_to_set(strs: &[String]) -> HashSet<String> {
    strs.iter().cloned().collect()
}

/// Return a copy of `strs` with every member of `remove` dropped,
/// keeping the original order.
pub fn strings_remove_strings(strs: &[String], remove: &[String]) -> Vec<String> {
    let remove: HashSet<&str> = remove.iter().map(|s| s.as_str()).collect();
    strs.iter()
        .filter(|s| !remove.contains(s.as_str()))
        .cloned()
        .collect()
}

/// Return the deduplicated intersection of `a` and `b`, in `a`'s order.
pub fn strings_intersect_strings(a: &[String], b: &[String]) -> Vec<String> {
    let b: HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let mut seen = HashSet::new();
    a.iter()
        .filter(|s| b.contains(s.as_str()) && seen.insert(s.as_str().to_string()))
        .cloned()
        .collect()
}

/// Compare two dotted version strings, like "1.0.1" and "1.2.3".
/// Returns true when `x >= y`. Non-numeric parts compare as lower.
pub fn version_gte(x: &str, y: &str) -> bool {
    let xa: Vec<&str> = x.split('.').collect();
    let ya: Vec<&str> = y.split('.').collect();
    for (i, xs) in xa.iter().enumerate() {
        if i >= ya.len() {
            return true;
        }
        let xv: u64 = match xs.parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let yv: u64 = match ya[i].parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        if xv > yv {
            return true;
        }
        if xv < yv {
            return false;
        }
    }
    xa.len() >= ya.len()
}

/// Control returned by an [`exponential_backoff_loop`] body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Stop looping; no future progress is possible.
    Stop,
    /// Nothing happened this cycle; sleep before the next attempt.
    None,
    /// Progress was made; retry immediately and reset the sleep.
    Made,
}

/// Call `f` in a loop, sleeping with exponential backoff between
/// no-progress cycles. A progress cycle resets the sleep to
/// `start_sleep` and retries immediately; sleeps cap at `max_sleep`.
pub async fn exponential_backoff_loop<F, Fut>(
    name: &str,
    mut f: F,
    start_sleep: Duration,
    backoff_factor: f32,
    max_sleep: Duration,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Progress>,
{
    let mut next_sleep = start_sleep;
    loop {
        match f().await {
            Progress::Stop => return,
            Progress::Made => {
                next_sleep = start_sleep;
            }
            Progress::None => {
                tracing::debug!("{}: no progress, sleeping {:?}", name, next_sleep);
                tokio::time::sleep(next_sleep).await;
                next_sleep = next_sleep.mul_f32(backoff_factor).min(max_sleep);
            }
        }
    }
}

/// Returns a token that is cancelled after `timeout_ms` milliseconds.
/// A non-positive timeout returns a token that never fires.
pub fn timeout_cancel_token(timeout_ms: i64) -> CancellationToken {
    let token = CancellationToken::new();
    if timeout_ms > 0 {
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
            t.cancel();
        });
    }
    token
}

/// Duration metrics updated atomically: total nanoseconds, invocation
/// count, and max single-invocation nanoseconds.
#[derive(Debug, Default)]
pub struct Timing {
    pub total_ns: AtomicU64,
    pub count: AtomicU64,
    pub max_ns: AtomicU64,
}

impl Timing {
    /// Record one invocation lasting `elapsed`.
    pub fn record(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut max = self.max_ns.load(Ordering::Relaxed);
        while ns > max {
            match self
                .max_ns
                .compare_exchange_weak(max, ns, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }
    }

    /// Time a closure and record its duration.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = std::time::Instant::now();
        let rv = f();
        self.record(start.elapsed());
        rv
    }
}

//! Per-provider sliding-window rate limiter (§4.3).
//!
//! Grounded on `llm_provider/base.py::RateLimiter`: a bounded window of recent request
//! timestamps, max size = configured RPM. Reimplemented as a `VecDeque` guarded by a `tokio`
//! mutex plus a condition-style retry loop instead of the original's recursive self-call —
//! same externally observable blocking semantics (`acquire()` blocks until the oldest timestamp
//! falls outside the window), no recursion (§9 design notes).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    requests_per_minute: u32,
    timestamps: std::collections::VecDeque<Instant>,
}

/// One sliding window per provider name, all guarded behind a single async mutex — contention
/// here is fine since `acquire` is already an I/O-adjacent suspension point (§5 suspension
/// point 2).
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn configure(&self, provider: &str, requests_per_minute: u32) {
        let mut windows = self.windows.lock().await;
        windows.entry(provider.to_string()).or_insert_with(|| Window {
            requests_per_minute,
            timestamps: std::collections::VecDeque::new(),
        });
    }

    /// Blocks until the window has room, then records the current timestamp. Multiple
    /// concurrent waiters all observe the cap because each iteration re-checks the window while
    /// holding the lock before sleeping (§8 "no thundering herd past the limit").
    pub async fn acquire(&self, provider: &str) {
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let window = windows.entry(provider.to_string()).or_insert_with(|| Window {
                    requests_per_minute: 60,
                    timestamps: std::collections::VecDeque::new(),
                });
                let now = Instant::now();
                while let Some(front) = window.timestamps.front() {
                    if now.duration_since(*front) >= WINDOW {
                        window.timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if window.timestamps.len() < window.requests_per_minute.max(1) as usize {
                    window.timestamps.push_back(now);
                    None
                } else {
                    let oldest = *window.timestamps.front().expect("window at capacity has an entry");
                    Some(WINDOW - now.duration_since(oldest))
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Count of requests currently inside the 60s window, used by tests and diagnostics.
    pub async fn current_window_count(&self, provider: &str) -> usize {
        let windows = self.windows.lock().await;
        windows.get(provider).map(|w| w.timestamps.len()).unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_allows_up_to_configured_rpm_immediately() {
        let limiter = RateLimiter::new();
        limiter.configure("openai", 3).await;
        for _ in 0..3 {
            limiter.acquire("openai").await;
        }
        assert_eq!(limiter.current_window_count("openai").await, 3);
    }

    #[tokio::test]
    async fn concurrent_waiters_all_observe_the_cap() {
        let limiter = std::sync::Arc::new(RateLimiter::new());
        limiter.configure("openai", 5).await;
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("openai").await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(limiter.current_window_count("openai").await, 5);
    }
}

//! Throttled remote polling
//!
//! Remote liveness checks and log fetches are expensive shell round-trips,
//! so they run at most once per interval and callers read cached values in
//! between. Transient failures keep the last known-good value.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::common::Result;

/// Allows an action at most once per interval
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    /// First call to [`Throttle::ready`] succeeds immediately
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// First call succeeds only after a full interval
    pub fn started(interval: Duration) -> Self {
        Self {
            interval,
            last: Some(Instant::now()),
        }
    }

    /// Start a new interval now
    pub fn restart(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Whether the action may run now; if so, restarts the interval
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Asks a device whether an application is still alive
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self) -> Result<bool>;
}

/// Fetches the current log of an application
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Liveness cached between throttled probes
///
/// Once the probe reports the application gone, the exit is latched.
pub struct ThrottledLiveness<P> {
    probe: P,
    throttle: Mutex<Throttle>,
    exited: AtomicBool,
}

impl<P: LivenessProbe> ThrottledLiveness<P> {
    /// The first probe runs one interval after creation
    pub fn new(probe: P, interval: Duration) -> Self {
        Self {
            probe,
            throttle: Mutex::new(Throttle::started(interval)),
            exited: AtomicBool::new(false),
        }
    }

    pub async fn has_exited(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }
        if !self.throttle.lock().await.ready() {
            return false;
        }
        self.probe_now().await
    }

    /// Probe immediately, ignoring the interval
    pub async fn refresh(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }
        self.throttle.lock().await.restart();
        self.probe_now().await
    }

    async fn probe_now(&self) -> bool {
        match self.probe.is_alive().await {
            Ok(true) => false,
            Ok(false) => {
                self.exited.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!("Liveness check failed, assuming still running: {}", e);
                false
            }
        }
    }

    /// Latch the exit without probing (e.g. after a kill)
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

struct LogState {
    throttle: Throttle,
    cached: String,
    final_attempted: bool,
    final_fetched: bool,
}

/// Log fetched at most once per interval, plus one final fetch after exit
pub struct ThrottledLog<S> {
    source: S,
    state: Mutex<LogState>,
}

impl<S: LogSource> ThrottledLog<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            source,
            state: Mutex::new(LogState {
                throttle: Throttle::new(interval),
                cached: String::new(),
                final_attempted: false,
                final_fetched: false,
            }),
        }
    }

    /// Current log. `exited` tells whether the application has exited; the
    /// first call that sees it does the final fetch, retried once per
    /// interval until it succeeds.
    pub async fn get(&self, exited: bool) -> String {
        let mut state = self.state.lock().await;
        if state.final_fetched {
            return state.cached.clone();
        }

        let due = if exited && !state.final_attempted {
            state.final_attempted = true;
            state.throttle.restart();
            true
        } else {
            state.throttle.ready()
        };

        if due {
            match self.source.fetch().await {
                Ok(log) => {
                    state.cached = log;
                    state.final_fetched = exited;
                }
                Err(e) => tracing::warn!("Log fetch failed, keeping previous output: {}", e),
            }
        }
        state.cached.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingProbe {
        calls: Arc<AtomicUsize>,
        alive_for: usize,
    }

    #[async_trait]
    impl LivenessProbe for CountingProbe {
        async fn is_alive(&self) -> Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(n < self.alive_for)
        }
    }

    struct CountingLog {
        calls: Arc<AtomicUsize>,
        /// Calls (by index) that fail
        failing: Vec<usize>,
    }

    #[async_trait]
    impl LogSource for CountingLog {
        async fn fetch(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&n) {
                return Err(Error::unreachable("emulator-5554", "device offline"));
            }
            Ok(format!("log v{}", n))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_throttled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let liveness = ThrottledLiveness::new(
            CountingProbe {
                calls: calls.clone(),
                alive_for: 1,
            },
            Duration::from_secs(10),
        );

        // Grace period: no probe yet
        assert!(!liveness.has_exited().await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!liveness.has_exited().await);
        assert!(!liveness.has_exited().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(liveness.has_exited().await);
        assert!(liveness.has_exited().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_final_fetch_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let log = ThrottledLog::new(
            CountingLog {
                calls: calls.clone(),
                failing: Vec::new(),
            },
            Duration::from_secs(15),
        );

        assert_eq!(log.get(false).await, "log v0");
        assert_eq!(log.get(false).await, "log v0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Exit observed: one final fetch regardless of the interval
        assert_eq!(log.get(true).await, "log v1");
        assert_eq!(log.get(true).await, "log v1");
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(log.get(true).await, "log v1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_keeps_last_good_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let log = ThrottledLog::new(
            CountingLog {
                calls: calls.clone(),
                failing: vec![1],
            },
            Duration::from_secs(15),
        );

        assert_eq!(log.get(false).await, "log v0");
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(log.get(false).await, "log v0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_fetch_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let log = ThrottledLog::new(
            CountingLog {
                calls: calls.clone(),
                failing: vec![1],
            },
            Duration::from_secs(15),
        );

        assert_eq!(log.get(false).await, "log v0");
        assert_eq!(log.get(true).await, "log v0");
        // retried on the interval, not on every call
        assert_eq!(log.get(true).await, "log v0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(log.get(true).await, "log v2");
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(log.get(true).await, "log v2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_ignores_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let liveness = ThrottledLiveness::new(
            CountingProbe {
                calls: calls.clone(),
                alive_for: 1,
            },
            Duration::from_secs(10),
        );

        assert!(!liveness.refresh().await);
        assert!(!liveness.has_exited().await);
        assert!(liveness.refresh().await);
        assert!(liveness.has_exited().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

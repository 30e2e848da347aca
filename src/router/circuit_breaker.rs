//! Sliding-window circuit breaker guarding the accelerated implementation.
//!
//! ```text
//! Closed ──(failure rate >= threshold)──> Open
//! Open ──(cooldown elapsed)─────────────> HalfOpen
//! HalfOpen ──(probe success)────────────> Closed
//! HalfOpen ──(probe failure)────────────> Open
//! ```
//!
//! One breaker is shared by every user of a decision engine, so all state sits
//! behind a mutex. Listeners run after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;

/// Millisecond wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CircuitEvent {
    Success {
        latency_ms: Option<f64>,
    },
    Failure {
        reason: String,
        latency_ms: Option<f64>,
    },
    StateChange(CircuitStateChange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_rate: f64,
    pub window_len: usize,
    pub opened_at_ms: Option<i64>,
    pub open_reason: Option<String>,
    pub half_open_probes_issued: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

type Listener = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at_ms: Option<i64>,
    open_reason: Option<String>,
    half_open_probes_issued: u32,
    total_successes: u64,
    total_failures: u64,
}

impl BreakerInner {
    fn new(capacity: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(capacity),
            opened_at_ms: None,
            open_reason: None,
            half_open_probes_issued: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn push(&mut self, success: bool, window_size: usize) {
        while self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn transition(
        &mut self,
        to: CircuitState,
        reason: impl Into<String>,
        now_ms: i64,
    ) -> Option<CircuitEvent> {
        let from = self.state;
        if from == to {
            return None;
        }
        let reason = reason.into();
        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at_ms = Some(now_ms);
                self.open_reason = Some(reason.clone());
                self.half_open_probes_issued = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_probes_issued = 0;
            }
            CircuitState::Closed => {
                self.window.clear();
                self.opened_at_ms = None;
                self.open_reason = None;
                self.half_open_probes_issued = 0;
            }
        }
        Some(CircuitEvent::StateChange(CircuitStateChange {
            from,
            to,
            reason,
            timestamp_ms: now_ms,
        }))
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    listeners: RwLock<Vec<Listener>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let config = CircuitBreakerConfig {
            window_size: config.window_size.max(1),
            half_open_max_probes: config.half_open_max_probes.max(1),
            ..config
        };
        Self {
            inner: Mutex::new(BreakerInner::new(config.window_size)),
            config,
            clock,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a callback for every breaker event.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Register a callback for state transitions only.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&CircuitStateChange) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let CircuitEvent::StateChange(change) = event {
                listener(change);
            }
        });
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_rate(&self) -> f64 {
        self.inner.lock().failure_rate()
    }

    /// Whether a call may go to the protected path right now.
    ///
    /// In `HalfOpen` each `true` consumes one probe slot.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        let allowed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let opened_at = inner.opened_at_ms.unwrap_or(now);
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed >= self.config.open_duration_ms as i64 {
                        events.extend(inner.transition(
                            CircuitState::HalfOpen,
                            "cooldown elapsed",
                            now,
                        ));
                        inner.half_open_probes_issued = 1;
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_probes_issued < self.config.half_open_max_probes {
                        inner.half_open_probes_issued += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.emit(&events);
        allowed
    }

    pub fn record_success(&self) {
        self.record(None, None);
    }

    pub fn record_success_with_latency(&self, latency: Duration) {
        self.record(None, Some(latency));
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        self.record(Some(reason.into()), None);
    }

    pub fn record_failure_with_latency(&self, reason: impl Into<String>, latency: Duration) {
        self.record(Some(reason.into()), Some(latency));
    }

    fn record(&self, failure: Option<String>, latency: Option<Duration>) {
        let now = self.clock.now_ms();
        let latency_ms = latency.map(|d| d.as_secs_f64() * 1000.0);
        let mut events = Vec::with_capacity(2);
        {
            let mut inner = self.inner.lock();
            match failure {
                None => {
                    inner.total_successes += 1;
                    events.push(CircuitEvent::Success { latency_ms });
                    match inner.state {
                        CircuitState::HalfOpen => {
                            events.extend(inner.transition(
                                CircuitState::Closed,
                                "half-open probe succeeded",
                                now,
                            ));
                        }
                        CircuitState::Closed => inner.push(true, self.config.window_size),
                        CircuitState::Open => {}
                    }
                }
                Some(reason) => {
                    inner.total_failures += 1;
                    events.push(CircuitEvent::Failure {
                        reason: reason.clone(),
                        latency_ms,
                    });
                    match inner.state {
                        CircuitState::HalfOpen => {
                            events.extend(inner.transition(
                                CircuitState::Open,
                                format!("half-open probe failed: {reason}"),
                                now,
                            ));
                        }
                        CircuitState::Closed => {
                            inner.push(false, self.config.window_size);
                            let rate = inner.failure_rate();
                            let window_len = inner.window.len();
                            if window_len >= self.config.minimum_samples
                                && rate >= self.config.failure_threshold
                            {
                                events.extend(inner.transition(
                                    CircuitState::Open,
                                    format!(
                                        "failure rate {:.2} over {} calls, last error: {reason}",
                                        rate, window_len
                                    ),
                                    now,
                                ));
                            }
                        }
                        CircuitState::Open => {}
                    }
                }
            }
        }
        self.emit(&events);
    }

    /// Force `Closed` and clear the window.
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let events: Vec<CircuitEvent> = {
            let mut inner = self.inner.lock();
            let event = inner.transition(CircuitState::Closed, "manual reset", now);
            inner.window.clear();
            event.into_iter().collect()
        };
        self.emit(&events);
    }

    /// Manual kill switch; starts a fresh cooldown.
    pub fn force_open(&self, reason: impl Into<String>) {
        let now = self.clock.now_ms();
        let reason = reason.into();
        let events: Vec<CircuitEvent> = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                inner.opened_at_ms = Some(now);
                inner.open_reason = Some(reason);
                Vec::new()
            } else {
                inner.transition(CircuitState::Open, reason, now).into_iter().collect()
            }
        };
        self.emit(&events);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_rate: inner.failure_rate(),
            window_len: inner.window.len(),
            opened_at_ms: inner.opened_at_ms,
            open_reason: inner.open_reason.clone(),
            half_open_probes_issued: inner.half_open_probes_issued,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    fn emit(&self, events: &[CircuitEvent]) {
        if events.is_empty() {
            return;
        }
        for event in events {
            if let CircuitEvent::StateChange(change) = event {
                match change.to {
                    CircuitState::Open => tracing::warn!(
                        from = %change.from,
                        reason = %change.reason,
                        "Circuit breaker opened"
                    ),
                    _ => tracing::info!(
                        from = %change.from,
                        to = %change.to,
                        reason = %change.reason,
                        "Circuit breaker state changed"
                    ),
                }
            }
        }
        // 回调期间不持有锁，监听器可以重入 subscribe
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for event in events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let cb = CircuitBreaker::with_clock(CircuitBreakerConfig::default(), clock.clone());
        (cb, clock)
    }

    #[test]
    fn listener_can_subscribe_from_callback() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cb = Arc::new(CircuitBreaker::with_clock(CircuitBreakerConfig::default(), clock));
        let late_events = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&cb);
        let counter = late_events.clone();
        cb.on_state_change(move |_| {
            if let Some(cb) = weak.upgrade() {
                assert_eq!(cb.state(), CircuitState::Open);
                let counter = counter.clone();
                cb.subscribe(move |_| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                });
            }
        });

        cb.force_open("manual");
        assert_eq!(late_events.load(std::sync::atomic::Ordering::SeqCst), 0);

        cb.record_failure("late");
        assert_eq!(late_events.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn trip_reason_reports_window() {
        let (cb, _) = breaker();
        for _ in 0..10 {
            cb.record_failure("boom");
        }
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        let reason = snapshot.open_reason.unwrap_or_default();
        assert!(reason.contains("over 10 calls"), "{reason}");
        assert!(reason.contains("last error: boom"), "{reason}");
    }

    #[test]
    fn starts_closed() {
        let (cb, _) = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.failure_rate(), 0.0);
    }

    #[test]
    fn trips_when_half_the_window_fails() {
        let (cb, _) = breaker();
        for i in 0..20 {
            if i % 2 == 0 {
                cb.record_success();
            } else {
                cb.record_failure("boom");
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn needs_minimum_samples_before_tripping() {
        let (cb, _) = breaker();
        for _ in 0..9 {
            cb.record_failure("boom");
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn mostly_healthy_window_stays_closed() {
        let (cb, _) = breaker();
        for i in 0..40 {
            if i % 4 == 0 {
                cb.record_failure("flaky");
            } else {
                cb.record_success();
            }
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!((cb.failure_rate() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let (cb, clock) = breaker();
        cb.force_open("test");
        assert!(!cb.can_execute());

        clock.advance(59_999);
        assert!(!cb.can_execute());

        clock.advance(1);
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_len, 0);
    }

    #[test]
    fn half_open_probe_budget_is_bounded() {
        let (cb, clock) = breaker();
        cb.force_open("test");
        clock.advance(60_000);
        assert!(cb.can_execute());
        assert!(cb.can_execute());
        assert!(cb.can_execute());
        assert!(!cb.can_execute());
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let (cb, clock) = breaker();
        cb.force_open("test");
        clock.advance(60_000);
        assert!(cb.can_execute());
        cb.record_failure("still broken");
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().opened_at_ms, Some(61_000));

        clock.advance(30_000);
        assert!(!cb.can_execute());
        clock.advance(30_000);
        assert!(cb.can_execute());
    }

    #[test]
    fn reset_closes_and_clears() {
        let (cb, _) = breaker();
        for _ in 0..12 {
            cb.record_failure("boom");
        }
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_rate(), 0.0);
        assert!(cb.can_execute());
    }

    #[test]
    fn listeners_see_transitions_and_outcomes() {
        let (cb, clock) = breaker();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let outcomes = Arc::new(AtomicUsize::new(0));

        let sink = changes.clone();
        cb.on_state_change(move |change| sink.lock().push((change.from, change.to)));
        let counter = outcomes.clone();
        cb.subscribe(move |event| {
            if !matches!(event, CircuitEvent::StateChange(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..10 {
            cb.record_failure("boom");
        }
        clock.advance(60_000);
        assert!(cb.can_execute());
        cb.record_success_with_latency(Duration::from_millis(3));

        assert_eq!(
            *changes.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert_eq!(outcomes.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn window_is_bounded() {
        let (cb, _) = breaker();
        for _ in 0..100 {
            cb.record_success();
        }
        let snap = cb.snapshot();
        assert_eq!(snap.window_len, 20);
        assert_eq!(snap.total_successes, 100);
    }

    #[test]
    fn concurrent_recording_is_consistent() {
        let cb = Arc::new(CircuitBreaker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record_success();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().total_successes, 800);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}

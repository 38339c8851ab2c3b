//! Circuit breaker shared by every stream consumer.
//!
//! Closed → (threshold consecutive errors) → Open for the current backoff →
//! Closed again. The backoff doubles, capped, each time the circuit opens; a
//! successful read resets both the error count and the backoff. After an open
//! period the next read is a trial read: one more failure re-opens immediately.

use metrics::counter;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive errors that open the circuit.
    pub threshold: u32,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Minimum spacing of error logs while failing.
    pub log_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            log_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    consecutive_errors: u32,
    /// Wait applied the next time the circuit opens.
    backoff: Duration,
    open_until: Option<Instant>,
    last_log: Option<Instant>,
    opens: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let threshold = config.threshold.max(1);
        let floor = config.backoff_floor;
        let ceiling = config.backoff_ceiling.max(floor);
        Self {
            config: BreakerConfig {
                threshold,
                backoff_ceiling: ceiling,
                ..config
            },
            state: RwLock::new(BreakerState {
                consecutive_errors: 0,
                backoff: floor,
                open_until: None,
                last_log: None,
                opens: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Time left in the current open period, `None` when reads may proceed.
    pub fn remaining_open(&self) -> Option<Duration> {
        let now = Instant::now();
        {
            let state = self.state.read();
            match state.open_until {
                None => return None,
                Some(until) if until > now => return Some(until - now),
                Some(_) => {}
            }
        }

        let mut state = self.state.write();
        if matches!(state.open_until, Some(until) if until <= now) {
            state.open_until = None;
            info!("circuit half-open, probing upstream");
        }
        None
    }

    pub fn is_open(&self) -> bool {
        self.remaining_open().is_some()
    }

    /// Reset after a successful read.
    pub fn record_success(&self) {
        {
            let state = self.state.read();
            if state.consecutive_errors == 0 && state.open_until.is_none() {
                return;
            }
        }

        let mut state = self.state.write();
        if state.consecutive_errors > 0 {
            info!(errors = state.consecutive_errors, "upstream reads recovered");
        }
        state.consecutive_errors = 0;
        state.backoff = self.config.backoff_floor;
        state.open_until = None;
        state.last_log = None;
    }

    /// Count a failed read. Returns the open period if this failure opened
    /// the circuit.
    pub fn record_failure(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.write();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);

        if state.consecutive_errors < self.config.threshold {
            return None;
        }
        // Another consumer already opened it.
        if matches!(state.open_until, Some(until) if until > now) {
            return None;
        }

        let wait = state.backoff;
        state.open_until = Some(now + wait);
        state.backoff = (wait * 2).min(self.config.backoff_ceiling);
        state.opens += 1;
        counter!("gateway_breaker_opens_total").increment(1);
        warn!(
            errors = state.consecutive_errors,
            backoff_ms = wait.as_millis() as u64,
            "circuit opened"
        );
        Some(wait)
    }

    /// Whether an error should be logged now; throttled to one per
    /// `log_interval` once errors are consecutive.
    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.write();
        match state.last_log {
            Some(last) if now.duration_since(last) < self.config.log_interval => false,
            _ => {
                state.last_log = Some(now);
                true
            }
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.read().consecutive_errors
    }

    /// Backoff the next opening will use.
    pub fn next_backoff(&self) -> Duration {
        self.state.read().backoff
    }

    pub fn open_count(&self) -> u64 {
        self.state.read().opens
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

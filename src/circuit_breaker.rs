//! Circuit Breaker (C3): per-endpoint failure isolation state machine.
//!
//! Closed → Open when the sliding-window failure ratio crosses the
//! threshold; Open → HalfOpen after `open_duration`; HalfOpen → Closed after
//! K consecutive successes, or back to Open (doubling `open_duration`, up to
//! a cap) on any failure.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::time_provider::SharedTimeProvider;

/// Errors raised when calling through a breaker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError {
    /// The breaker is open and rejecting calls outright.
    #[error("circuit is open")]
    Open,
}

/// The breaker's externally observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A single probe call is allowed through to test recovery.
    HalfOpen,
}

/// Tunable parameters for one breaker instance.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Size of the sliding outcome window.
    pub window: usize,
    /// Failure ratio (0.0-1.0) at which `Closed` transitions to `Open`.
    pub open_threshold: f64,
    /// Minimum samples in the window before opening is considered.
    pub min_samples: usize,
    /// How long the breaker stays `Open` before trying `HalfOpen`.
    pub open_duration: std::time::Duration,
    /// Cap on the exponential backoff of `open_duration`.
    pub open_duration_cap: std::time::Duration,
    /// Consecutive successes required in `HalfOpen` to close.
    pub half_open_successes: u32,
}

struct Inner {
    state: BreakerState,
    outcomes: VecDeque<bool>,
    half_open_success_streak: u32,
    opened_at: Option<std::time::Instant>,
    current_open_duration: std::time::Duration,
    half_open_probe_in_flight: bool,
}

/// A single endpoint's circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    time: SharedTimeProvider,
}

impl CircuitBreaker {
    /// Creates a new breaker, starting `Closed`.
    #[must_use]
    pub fn new(config: BreakerConfig, time: SharedTimeProvider) -> Arc<Self> {
        let current_open_duration = config.open_duration;
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                outcomes: VecDeque::with_capacity(config.window),
                half_open_success_streak: 0,
                opened_at: None,
                current_open_duration,
                half_open_probe_in_flight: false,
            }),
            time,
        })
    }

    /// Returns the current state, first transitioning `Open` to `HalfOpen`
    /// if the open duration has elapsed.
    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if self.time.instant().duration_since(opened_at) >= inner.current_open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_success_streak = 0;
                    inner.half_open_probe_in_flight = false;
                }
            }
        }
    }

    /// Checks out permission to call; in `HalfOpen`, admits exactly one
    /// concurrent probe (invariant 7, §8).
    pub async fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().await;
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Err(BreakerError::Open)
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call outcome.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                push_outcome(&mut inner.outcomes, self.config.window, true);
            }
            BreakerState::HalfOpen => {
                inner.half_open_probe_in_flight = false;
                inner.half_open_success_streak += 1;
                if inner.half_open_success_streak >= self.config.half_open_successes {
                    inner.state = BreakerState::Closed;
                    inner.outcomes.clear();
                    inner.current_open_duration = self.config.open_duration;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Records a failed call outcome, possibly opening (or re-opening) the
    /// breaker.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                push_outcome(&mut inner.outcomes, self.config.window, false);
                if inner.outcomes.len() >= self.config.min_samples {
                    let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
                    #[allow(clippy::cast_precision_loss)]
                    let ratio = failures as f64 / inner.outcomes.len() as f64;
                    if ratio >= self.config.open_threshold {
                        self.open(&mut inner);
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_probe_in_flight = false;
                inner.current_open_duration = std::cmp::min(
                    inner.current_open_duration * 2,
                    self.config.open_duration_cap,
                );
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(self.time.instant());
        inner.outcomes.clear();
    }
}

fn push_outcome(outcomes: &mut VecDeque<bool>, window: usize, ok: bool) {
    if outcomes.len() == window {
        outcomes.pop_front();
    }
    outcomes.push_back(ok);
}

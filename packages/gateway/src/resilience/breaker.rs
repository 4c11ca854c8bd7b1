// ABOUTME: Per-engine circuit breaker as a pure transition function over CircuitState
// ABOUTME: A thin keyed store persists the states; the clock is injected for deterministic tests

use crate::clock::{until, SharedClock};
use crate::settings::BreakerConfig;
use crate::types::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Retry hint handed to requests that arrive while a half-open trial is running
pub const TRIAL_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
    pub trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A request wants to use the engine
    Request { now: DateTime<Utc> },
    Success,
    Failure { now: DateTime<Utc> },
    /// The attempt ended without telling us anything about engine health
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Pass,
    /// The single half-open probe
    Trial,
    Reject { retry_after: Duration },
}

/// Decide whether a request may proceed, and the state that results from asking
pub fn permit(state: &CircuitState, now: DateTime<Utc>, config: &BreakerConfig) -> (Permit, CircuitState) {
    match state.phase {
        CircuitPhase::Closed => (Permit::Pass, state.clone()),
        CircuitPhase::Open => {
            let reopen_at = state
                .last_failure
                .map(|at| at + crate::clock::to_chrono(config.reset_timeout()));
            match reopen_at {
                Some(at) if at > now => (
                    Permit::Reject {
                        retry_after: until(at, now),
                    },
                    state.clone(),
                ),
                _ => (
                    Permit::Trial,
                    transition(state, BreakerEvent::Request { now }, config),
                ),
            }
        }
        CircuitPhase::HalfOpen if state.trial_in_flight => (
            Permit::Reject {
                retry_after: TRIAL_RETRY_AFTER,
            },
            state.clone(),
        ),
        CircuitPhase::HalfOpen => (
            Permit::Trial,
            transition(state, BreakerEvent::Request { now }, config),
        ),
    }
}

/// `(state, event) -> state'`
pub fn transition(state: &CircuitState, event: BreakerEvent, config: &BreakerConfig) -> CircuitState {
    let mut next = state.clone();
    match (state.phase, event) {
        (CircuitPhase::Closed, BreakerEvent::Success) => {
            next.consecutive_failures = 0;
        }
        (CircuitPhase::Closed, BreakerEvent::Failure { now }) => {
            next.consecutive_failures = state.consecutive_failures.saturating_add(1);
            next.last_failure = Some(now);
            if next.consecutive_failures >= config.failure_threshold {
                next.phase = CircuitPhase::Open;
            }
        }

        (CircuitPhase::Open, BreakerEvent::Request { now }) => {
            let elapsed = state
                .last_failure
                .map(|at| now >= at + crate::clock::to_chrono(config.reset_timeout()))
                .unwrap_or(true);
            if elapsed {
                next.phase = CircuitPhase::HalfOpen;
                next.half_open_successes = 0;
                next.trial_in_flight = true;
            }
        }

        (CircuitPhase::HalfOpen, BreakerEvent::Request { .. }) => {
            next.trial_in_flight = true;
        }
        (CircuitPhase::HalfOpen, BreakerEvent::Success) => {
            next.trial_in_flight = false;
            next.half_open_successes = state.half_open_successes.saturating_add(1);
            if next.half_open_successes >= config.success_threshold {
                next = CircuitState::default();
            }
        }
        (CircuitPhase::HalfOpen, BreakerEvent::Failure { now }) => {
            next.phase = CircuitPhase::Open;
            next.trial_in_flight = false;
            next.half_open_successes = 0;
            next.last_failure = Some(now);
        }
        (CircuitPhase::HalfOpen, BreakerEvent::Neutral) => {
            next.trial_in_flight = false;
        }

        // Closed ignores requests and neutral outcomes; open ignores late results
        _ => {}
    }
    next
}

/// Keyed holder of circuit states
#[derive(Debug, Default)]
pub struct CircuitStore {
    states: Mutex<HashMap<Engine, CircuitState>>,
}

impl CircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, engine: Engine) -> CircuitState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(&engine).cloned().unwrap_or_default()
    }

    /// Apply `update` to the stored state atomically, returning its output
    pub fn update<R>(&self, engine: Engine, update: impl FnOnce(&CircuitState) -> (R, CircuitState)) -> R {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let current = states.entry(engine).or_default();
        let (output, next) = update(current);
        *current = next;
        output
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<CircuitStore>,
    config: BreakerConfig,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(store: Arc<CircuitStore>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Ask to use `engine`. The returned attempt must be settled with its outcome;
    /// dropping it unsettled counts as a neutral outcome so a cancelled trial frees the slot.
    pub fn acquire(&self, engine: Engine) -> Attempt<'_> {
        let now = self.clock.now();
        let granted = self
            .store
            .update(engine, |state| permit(state, now, &self.config));
        if granted == Permit::Trial {
            info!(engine = %engine, "Circuit half-open, sending trial request");
        }
        Attempt {
            breaker: self,
            engine,
            permit: granted,
            settled: matches!(granted, Permit::Reject { .. }),
        }
    }

    pub fn record_success(&self, engine: Engine) {
        self.record(engine, BreakerEvent::Success);
    }

    pub fn record_failure(&self, engine: Engine) {
        let now = self.clock.now();
        self.record(engine, BreakerEvent::Failure { now });
    }

    pub fn record_neutral(&self, engine: Engine) {
        self.record(engine, BreakerEvent::Neutral);
    }

    fn record(&self, engine: Engine, event: BreakerEvent) {
        let (before, after) = self.store.update(engine, |state| {
            let next = transition(state, event, &self.config);
            ((state.phase, next.phase), next)
        });
        if before != after {
            match after {
                CircuitPhase::Open => warn!(
                    engine = %engine,
                    from = ?before,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit opened"
                ),
                CircuitPhase::Closed => info!(engine = %engine, "Circuit closed"),
                CircuitPhase::HalfOpen => {}
            }
        }
    }

    pub fn snapshot(&self, engine: Engine) -> CircuitState {
        self.store.get(engine)
    }
}

/// One permitted use of an engine, outstanding until its outcome is recorded
#[must_use = "an attempt records a neutral outcome when dropped unsettled"]
pub struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    engine: Engine,
    permit: Permit,
    settled: bool,
}

impl Attempt<'_> {
    pub fn permit(&self) -> Permit {
        self.permit
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.engine);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.engine);
    }

    pub fn neutral(mut self) {
        self.settled = true;
        self.breaker.record_neutral(self.engine);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.permit == Permit::Trial {
            warn!(engine = %self.engine, "Trial request abandoned before finishing");
        }
        self.breaker.record_neutral(self.engine);
    }
}

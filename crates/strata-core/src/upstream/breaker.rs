//! Circuit breaker guarding the upstream node.
//!
//! Three states: `Closed` admits calls up to the concurrency limit and trips
//! after a run of consecutive failures; `Open` rejects everything until the
//! reset timeout elapses; `HalfOpen` admits exactly one trial call whose
//! outcome decides between closing again and re-opening.
//!
//! The transition function is pure given `(state, event, counters, clock)`.
//! All mutable fields live under one mutex that is held only across the
//! transition itself, never across I/O: callers take a [`CallToken`] at
//! admission and resolve it with [`Breaker::complete`] (or release it with
//! [`Breaker::abandon`] when the call never reached the wire).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Why the breaker opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    /// The consecutive-failure threshold was reached.
    Threshold,
    /// Calls kept arriving over the concurrency cap.
    Concurrency,
    /// The half-open trial call failed.
    Trial,
}

impl OpenReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "error threshold breached",
            Self::Concurrency => "concurrency limit breached",
            Self::Trial => "trial request failed",
        }
    }

    fn as_label(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Concurrency => "concurrency",
            Self::Trial => "trial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning: `error_threshold` consecutive failures trip the circuit,
/// at most `concurrency` calls run at once, and an open circuit waits
/// `reset_timeout` before admitting a trial.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub error_threshold: u32,
    pub concurrency: u32,
    pub reset_timeout: Duration,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    inflight: u32,
    trial_inflight: bool,
    opened_at: Option<Instant>,
    open_reason: Option<OpenReason>,
}

/// Proof that a call was admitted. Must be resolved exactly once via
/// `complete` or `abandon`.
#[derive(Debug)]
#[must_use = "an admitted call must be completed or abandoned"]
pub struct CallToken {
    trial: bool,
}

/// Outcome of admission.
#[derive(Debug)]
pub enum Admitted {
    /// A normal closed-state call.
    Call(CallToken),
    /// The reset timeout elapsed and this call is the half-open trial; the
    /// caller should re-establish its upstream handle before proceeding.
    Trial(CallToken),
}

impl Admitted {
    #[must_use]
    pub fn into_token(self) -> CallToken {
        match self {
            Self::Call(t) | Self::Trial(t) => t,
        }
    }
}

/// Why admission was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmitError {
    /// The circuit is open (or a trial is already in flight).
    Open,
    /// Rejected over the concurrency cap. `tripped` is set when this
    /// rejection was the one that opened the circuit, so the caller can
    /// drop its handle.
    Concurrency { tripped: bool },
}

/// What a completion caused.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// No transition.
    Noop,
    /// The circuit opened; the caller should drop its upstream handle.
    Opened(OpenReason),
    /// The trial succeeded and the circuit closed.
    Closed,
}

pub struct Breaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
}

impl Breaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                inflight: 0,
                trial_inflight: false,
                opened_at: None,
                open_reason: None,
            }),
            config,
        }
    }

    /// Admits or rejects a call. O(1) and lock-only: an open circuit is
    /// refused without touching anything else.
    pub fn try_admit(&self) -> Result<Admitted, AdmitError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => {
                let elapsed =
                    inner.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed < self.config.reset_timeout {
                    return Err(AdmitError::Open);
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_inflight = true;
                tracing::info!("circuit half-open, admitting trial call");
                Ok(Admitted::Trial(CallToken { trial: true }))
            }
            BreakerState::HalfOpen => {
                if inner.trial_inflight {
                    return Err(AdmitError::Open);
                }
                inner.trial_inflight = true;
                Ok(Admitted::Trial(CallToken { trial: true }))
            }
            BreakerState::Closed => {
                if inner.inflight >= self.config.concurrency {
                    inner.failures += 1;
                    let tripped = inner.failures >= self.config.error_threshold;
                    if tripped {
                        Self::open(&mut inner, OpenReason::Concurrency);
                    }
                    return Err(AdmitError::Concurrency { tripped });
                }
                inner.inflight += 1;
                Ok(Admitted::Call(CallToken { trial: false }))
            }
        }
    }

    /// Resolves an admitted call with its outcome.
    pub fn complete(&self, token: CallToken, ok: bool) -> Completion {
        let mut inner = self.inner.lock();
        if token.trial {
            inner.trial_inflight = false;
            if ok {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.open_reason = None;
                metrics::gauge!("upstream_circuit_status").set(0.0);
                tracing::info!("circuit closed after successful trial");
                return Completion::Closed;
            }
            Self::open(&mut inner, OpenReason::Trial);
            return Completion::Opened(OpenReason::Trial);
        }

        inner.inflight = inner.inflight.saturating_sub(1);
        if ok {
            inner.failures = 0;
            return Completion::Noop;
        }
        inner.failures += 1;
        if inner.state == BreakerState::Closed && inner.failures >= self.config.error_threshold {
            Self::open(&mut inner, OpenReason::Threshold);
            return Completion::Opened(OpenReason::Threshold);
        }
        Completion::Noop
    }

    /// Releases an admitted call that never reached the wire (for example
    /// the client found no handle). Counts as neither success nor failure,
    /// except that an unusable trial re-opens the circuit.
    pub fn abandon(&self, token: CallToken) -> Completion {
        let mut inner = self.inner.lock();
        if token.trial {
            inner.trial_inflight = false;
            Self::open(&mut inner, OpenReason::Trial);
            return Completion::Opened(OpenReason::Trial);
        }
        inner.inflight = inner.inflight.saturating_sub(1);
        Completion::Noop
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn open_reason(&self) -> Option<OpenReason> {
        self.inner.lock().open_reason
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    fn open(inner: &mut Inner, reason: OpenReason) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.open_reason = Some(reason);
        inner.failures = 0;
        inner.trial_inflight = false;
        metrics::gauge!("upstream_circuit_status").set(1.0);
        metrics::counter!("upstream_circuit_opened_total", "reason" => reason.as_label())
            .increment(1);
        tracing::warn!(reason = reason.as_str(), "circuit opened");
    }
}

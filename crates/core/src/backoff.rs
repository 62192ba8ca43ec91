//! Bounded retry schedule shared by the reconcile loops.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::env_parse;

/// Jittered delays stretch by up to this fraction of the nominal delay.
pub const JITTER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("backoff steps must be >= 1")]
    ZeroSteps,
    #[error("backoff factor must be a finite number >= 1.0, got {0}")]
    BadFactor(f64),
}

/// Retry schedule: `steps` attempts in total, sleeping between them with a delay that
/// starts at `initial_delay` and grows by `factor`, optionally capped and jittered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy")]
pub struct BackoffPolicy {
    steps: u32,
    initial_delay: Duration,
    factor: f64,
    jitter: bool,
    cap: Option<Duration>,
}

/// Unvalidated wire form; deserialization goes through [`BackoffPolicy::new`].
#[derive(Deserialize)]
struct RawPolicy {
    steps: u32,
    initial_delay: Duration,
    factor: f64,
    #[serde(default)]
    jitter: bool,
    #[serde(default)]
    cap: Option<Duration>,
}

impl TryFrom<RawPolicy> for BackoffPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, PolicyError> {
        let p = Self::new(raw.steps, raw.initial_delay, raw.factor, raw.jitter)?;
        Ok(Self { cap: raw.cap, ..p })
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { steps: 20, initial_delay: Duration::from_secs(1), factor: 1.3, jitter: false, cap: Some(Duration::from_secs(40)) }
    }
}

impl BackoffPolicy {
    pub fn new(steps: u32, initial_delay: Duration, factor: f64, jitter: bool) -> Result<Self, PolicyError> {
        if steps == 0 {
            return Err(PolicyError::ZeroSteps);
        }
        if !factor.is_finite() || factor < 1.0 {
            return Err(PolicyError::BadFactor(factor));
        }
        Ok(Self { steps, initial_delay, factor, jitter, cap: None })
    }

    /// Constant-delay policy, handy for tests.
    pub fn fixed(steps: u32, delay: Duration) -> Result<Self, PolicyError> { Self::new(steps, delay, 1.0, false) }

    pub fn with_cap(mut self, cap: Duration) -> Self { self.cap = Some(cap); self }
    pub fn without_cap(mut self) -> Self { self.cap = None; self }

    pub fn steps(&self) -> u32 { self.steps }
    pub fn initial_delay(&self) -> Duration { self.initial_delay }
    pub fn factor(&self) -> f64 { self.factor }
    pub fn jitter(&self) -> bool { self.jitter }
    pub fn cap(&self) -> Option<Duration> { self.cap }

    /// Default policy overridden by `KEEL_BACKOFF_*` env knobs. Invalid values are logged
    /// and the default for that knob is kept.
    pub fn from_env() -> Self {
        let d = Self::default();
        let steps = env_parse::<u32>("KEEL_BACKOFF_STEPS").filter(|s| *s >= 1).unwrap_or(d.steps);
        let initial_delay = env_parse::<u64>("KEEL_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.initial_delay);
        let factor = env_parse::<f64>("KEEL_BACKOFF_FACTOR").filter(|f| f.is_finite() && *f >= 1.0).unwrap_or(d.factor);
        let jitter = std::env::var("KEEL_BACKOFF_JITTER")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(d.jitter);
        let cap = match env_parse::<u64>("KEEL_BACKOFF_CAP_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => d.cap,
        };
        Self { steps, initial_delay, factor, jitter, cap }
    }

    pub fn schedule(&self) -> Schedule {
        Schedule { remaining: self.steps, next: self.initial_delay, policy: self.clone() }
    }

    /// Nominal (unjittered) sleeps between attempts; there are `steps - 1` of them.
    pub fn delays(&self) -> Vec<Duration> {
        let mut nominal = self.clone();
        nominal.jitter = false;
        let mut s = nominal.schedule();
        std::iter::from_fn(|| s.next_delay()).collect()
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(u64::MAX) }

/// `d * factor`, saturating at `Duration::MAX` instead of panicking.
fn grow(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Per-call cursor over a [`BackoffPolicy`]. Not shared between calls.
#[derive(Debug, Clone)]
pub struct Schedule {
    remaining: u32,
    next: Duration,
    policy: BackoffPolicy,
}

impl Schedule {
    /// Record one failed attempt. Returns the delay to sleep before the next attempt, or
    /// `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return None;
        }
        let nominal = self.next;
        let grown = grow(nominal, self.policy.factor);
        self.next = match self.policy.cap {
            Some(cap) => grown.min(cap),
            None => grown,
        };
        let nominal = match self.policy.cap {
            Some(cap) => nominal.min(cap),
            None => nominal,
        };
        if self.policy.jitter && !nominal.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..JITTER_FRACTION);
            Some(nominal.saturating_add(grow(nominal, extra)))
        } else {
            Some(nominal)
        }
    }

    /// Attempts still allowed, including the one about to run.
    pub fn remaining(&self) -> u32 { self.remaining }
}

//! Shared retry driver for the reconcile loops.

use keel_core::{duration_ms, ClientError, ObjectIdentity, Schedule};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ApplyContext, ApplyError};

/// Outcome of one attempt: finished, or hit a retryable race.
pub(crate) enum Step<T> {
    Done(T),
    Retry(ClientError),
}

/// Per-call retry state. Callers decide what is retryable; this only spends the budget,
/// sleeps and honours cancellation.
pub(crate) struct RetryLoop<'a> {
    ctx: &'a ApplyContext,
    id: &'a ObjectIdentity,
    op: &'static str,
    schedule: Schedule,
    attempt: u32,
    started: Instant,
}

impl<'a> RetryLoop<'a> {
    pub(crate) fn new(ctx: &'a ApplyContext, id: &'a ObjectIdentity, op: &'static str) -> Self {
        Self { ctx, id, op, schedule: ctx.backoff.schedule(), attempt: 0, started: Instant::now() }
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        counter!("keel_apply_attempts", 1u64, "op" => self.op);
        self.attempt
    }

    /// Must pass before every remote call.
    pub(crate) fn guard(&self) -> Result<(), ApplyError> { self.ctx.check(self.id) }

    /// Spend one step for `cause`. Sleeps and returns `Ok` if another attempt is allowed;
    /// otherwise hands `cause` back verbatim.
    pub(crate) async fn backoff(&mut self, cause: ClientError) -> Result<(), ApplyError> {
        let Some(delay) = self.schedule.next_delay() else {
            counter!("keel_apply_exhausted", 1u64, "op" => self.op, "reason" => cause.kind().as_str());
            warn!(op = self.op, id = %self.id, attempts = self.attempt, error = %cause, "retry budget exhausted");
            return Err(ApplyError::Client(cause));
        };
        counter!("keel_apply_retries", 1u64, "op" => self.op, "reason" => cause.kind().as_str());
        debug!(
            op = self.op,
            id = %self.id,
            attempt = self.attempt,
            remaining = self.schedule.remaining(),
            delay_ms = duration_ms(delay),
            reason = cause.kind().as_str(),
            "retrying after backoff"
        );
        self.guard()?;
        self.ctx.sleep(delay, self.id).await
    }

    /// Record call latency and outcome.
    pub(crate) fn finish(&self, outcome: &'static str) {
        histogram!("keel_apply_latency_ms", self.started.elapsed().as_secs_f64() * 1000.0, "op" => self.op);
        counter!("keel_apply_result", 1u64, "op" => self.op, "outcome" => outcome);
    }

    pub(crate) fn attempts(&self) -> u32 { self.attempt }
}

//! Keel apply: safe create-or-update and create-anew for a single named object.
//!
//! Both entry points reconcile against a [`ResourceClient`] without any locking. Races
//! surface as `AlreadyExists` or `Conflict` and are absorbed by a bounded backoff loop;
//! every other failure ends the call immediately.

#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod create_anew;
mod create_or_update;
pub mod mutate;
mod retry;

pub use create_anew::{create_anew, create_anew_with, Recreate};
pub use create_or_update::create_or_update;
pub use keel_core::{BackoffPolicy, ClientError, ErrorKind, ObjectIdentity, OperationResult, ResourceClient, Versioned};
pub use mutate::replace;

/// Per-call knobs: backoff schedule, cancellation and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    pub backoff: BackoffPolicy,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl ApplyContext {
    pub fn new(backoff: BackoffPolicy) -> Self { Self { backoff, ..Default::default() } }

    /// Backoff from `KEEL_BACKOFF_*`, no cancellation, no deadline.
    pub fn from_env() -> Self { Self::new(BackoffPolicy::from_env()) }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Give up once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Fails if the call was cancelled or ran past its deadline.
    pub(crate) fn check(&self, id: &ObjectIdentity) -> Result<(), ApplyError> {
        if self.cancel.is_cancelled() {
            return Err(ApplyError::Cancelled(id.clone()));
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(ApplyError::DeadlineExceeded(id.clone())),
            _ => Ok(()),
        }
    }

    /// Sleep for `delay` unless cancellation or the deadline comes first.
    pub(crate) async fn sleep(&self, delay: Duration, id: &ObjectIdentity) -> Result<(), ApplyError> {
        let deadline = self.deadline;
        let until_deadline = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApplyError::Cancelled(id.clone())),
            _ = until_deadline => Err(ApplyError::DeadlineExceeded(id.clone())),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// A store error: either fatal on first sight or the last retryable one after the
    /// backoff budget ran out. Passed through unchanged so callers can match on it.
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("mutate failed for {identity}: {source}")]
    Mutate {
        identity: ObjectIdentity,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("reconcile of {0} cancelled")]
    Cancelled(ObjectIdentity),
    #[error("deadline exceeded while reconciling {0}")]
    DeadlineExceeded(ObjectIdentity),
}

impl ApplyError {
    pub(crate) fn mutate(id: &ObjectIdentity, err: anyhow::Error) -> Self {
        ApplyError::Mutate { identity: id.clone(), source: err.into() }
    }

    /// Kind of the underlying store error, if this is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ApplyError::Client(e) => Some(e.kind()),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool { self.kind() == Some(ErrorKind::Conflict) }
    pub fn is_already_exists(&self) -> bool { self.kind() == Some(ErrorKind::AlreadyExists) }
    pub fn is_cancelled(&self) -> bool { matches!(self, ApplyError::Cancelled(_) | ApplyError::DeadlineExceeded(_)) }
}

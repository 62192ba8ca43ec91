use keel_core::{ClientError, ObjectIdentity, OperationResult, ResourceClient, Versioned};
use tracing::{debug, info};

use crate::mutate;
use crate::retry::{RetryLoop, Step};
use crate::{ApplyContext, ApplyError};

const OP: &str = "create_or_update";

/// Make the stored object for `seed`'s identity match `mutate(current)`, writing only when
/// needed.
///
/// Each attempt fetches the live object (or falls back to `seed` when absent), runs
/// `mutate` on it and then creates, updates or does nothing. `AlreadyExists` on create
/// pivots to the update path; `Conflict` on update starts a fresh attempt after backoff.
/// When the budget in `ctx.backoff` runs out, the last of those errors is returned.
pub async fn create_or_update<K, C, F>(
    client: &C,
    ctx: &ApplyContext,
    seed: K,
    mut mutate: F,
) -> Result<OperationResult, ApplyError>
where
    K: Versioned,
    C: ResourceClient<K> + ?Sized,
    F: FnMut(K) -> anyhow::Result<K>,
{
    let id = seed.identity();
    let mut lp = RetryLoop::new(ctx, &id, OP);
    let res = loop {
        lp.begin_attempt();
        match attempt(client, &lp, &id, &seed, &mut mutate).await {
            Ok(Step::Done(result)) => break Ok(result),
            Ok(Step::Retry(cause)) => {
                if let Err(e) = lp.backoff(cause).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };
    match &res {
        Ok(result) => {
            info!(id = %id, result = %result, attempts = lp.attempts(), "reconciled");
            lp.finish(result.as_str());
        }
        Err(e) => {
            debug!(id = %id, error = %e, attempts = lp.attempts(), "reconcile failed");
            lp.finish("error");
        }
    }
    res
}

async fn attempt<K, C, F>(
    client: &C,
    lp: &RetryLoop<'_>,
    id: &ObjectIdentity,
    seed: &K,
    mutate: &mut F,
) -> Result<Step<OperationResult>, ApplyError>
where
    K: Versioned,
    C: ResourceClient<K> + ?Sized,
    F: FnMut(K) -> anyhow::Result<K>,
{
    lp.guard()?;
    let existing = match client.get(id).await {
        Ok(obj) => obj,
        Err(ClientError::NotFound(_)) => {
            let mut fresh = seed.clone();
            fresh.set_version(None);
            let desired = mutate::run(mutate, fresh, id)?;
            lp.guard()?;
            match client.create(&desired).await {
                Ok(created) => {
                    debug!(id = %id, version = ?created.version(), "created");
                    return Ok(Step::Done(OperationResult::Created));
                }
                Err(cause @ ClientError::AlreadyExists(_)) => {
                    debug!(id = %id, "create lost a race; switching to update");
                    lp.guard()?;
                    match client.get(id).await {
                        Ok(obj) => obj,
                        // Still invisible to us: stale read. Start over after backoff.
                        Err(ClientError::NotFound(_)) => return Ok(Step::Retry(cause)),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let expected = existing.version().unwrap_or_default().to_string();
    let mut desired = mutate::run(mutate, existing.clone(), id)?;
    if desired.semantic_eq(&existing) {
        debug!(id = %id, version = %expected, "already up to date");
        return Ok(Step::Done(OperationResult::Unchanged));
    }
    desired.set_version(existing.version().map(str::to_string));

    lp.guard()?;
    match client.update(&desired, &expected).await {
        Ok(updated) => {
            debug!(id = %id, from = %expected, to = ?updated.version(), "updated");
            Ok(Step::Done(OperationResult::Updated))
        }
        Err(cause @ ClientError::Conflict { .. }) => {
            debug!(id = %id, version = %expected, "update conflicted");
            Ok(Step::Retry(cause))
        }
        Err(e) => Err(e.into()),
    }
}

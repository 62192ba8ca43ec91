use keel_core::{ClientError, ObjectIdentity, ResourceClient, Versioned};
use tracing::{debug, info};

use crate::retry::{RetryLoop, Step};
use crate::{ApplyContext, ApplyError};

const OP: &str = "create_anew";

/// When `create_anew_with` may skip the delete/create cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Recreate {
    /// Always delete and create, even if the live object already matches.
    #[default]
    Always,
    /// Keep a live object that is semantically equal to the desired one.
    IfChanged,
}

/// Replace the object outright: delete whatever holds `desired`'s identity, then create
/// `desired` fresh. Returns the created object.
pub async fn create_anew<K, C>(client: &C, ctx: &ApplyContext, desired: K) -> Result<K, ApplyError>
where
    K: Versioned,
    C: ResourceClient<K> + ?Sized,
{
    create_anew_with(client, ctx, desired, Recreate::Always).await
}

/// [`create_anew`] with an explicit [`Recreate`] mode.
///
/// `AlreadyExists` on create (the old object lingers or another writer recreated it)
/// repeats the delete/create cycle after backoff. Any other delete or create error is
/// returned at once; `NotFound` on delete counts as success.
pub async fn create_anew_with<K, C>(client: &C, ctx: &ApplyContext, desired: K, mode: Recreate) -> Result<K, ApplyError>
where
    K: Versioned,
    C: ResourceClient<K> + ?Sized,
{
    let id = desired.identity();
    let mut lp = RetryLoop::new(ctx, &id, OP);

    if mode == Recreate::IfChanged {
        lp.guard()?;
        match client.get(&id).await {
            Ok(live) if live.semantic_eq(&desired) => {
                info!(id = %id, version = ?live.version(), "live object matches; not recreating");
                lp.finish("unchanged");
                return Ok(live);
            }
            Ok(_) | Err(ClientError::NotFound(_)) => {}
            Err(e) => {
                lp.finish("error");
                return Err(e.into());
            }
        }
    }

    let mut body = desired;
    body.set_version(None);
    body.set_uid(None);

    let res = loop {
        lp.begin_attempt();
        match replace_once(client, &lp, &id, &body).await {
            Ok(Step::Done(created)) => break Ok(created),
            Ok(Step::Retry(cause)) => {
                if let Err(e) = lp.backoff(cause).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };
    match &res {
        Ok(created) => {
            info!(id = %id, uid = ?created.uid(), version = ?created.version(), attempts = lp.attempts(), "recreated");
            lp.finish("created");
        }
        Err(e) => {
            debug!(id = %id, error = %e, attempts = lp.attempts(), "recreate failed");
            lp.finish("error");
        }
    }
    res
}

async fn replace_once<K, C>(client: &C, lp: &RetryLoop<'_>, id: &ObjectIdentity, body: &K) -> Result<Step<K>, ApplyError>
where
    K: Versioned,
    C: ResourceClient<K> + ?Sized,
{
    lp.guard()?;
    match client.delete(id).await {
        Ok(()) => debug!(id = %id, "deleted previous object"),
        Err(ClientError::NotFound(_)) => debug!(id = %id, "nothing to delete"),
        Err(e) => return Err(e.into()),
    }

    lp.guard()?;
    match client.create(body).await {
        Ok(created) => Ok(Step::Done(created)),
        Err(cause @ ClientError::AlreadyExists(_)) => {
            debug!(id = %id, "create still blocked by an existing object");
            Ok(Step::Retry(cause))
        }
        Err(e) => Err(e.into()),
    }
}

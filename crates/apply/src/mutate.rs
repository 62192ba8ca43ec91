//! Mutate functions: `FnMut(existing) -> anyhow::Result<desired>`.
//!
//! A mutate function runs once per attempt against the freshest observed object, so it
//! must tolerate being called repeatedly. On the create path it receives the caller's seed
//! with its version token cleared. It cannot tell a create-miss pivot from a plain update.
//! Its errors end the call without retry.

use anyhow::anyhow;
use keel_core::{ObjectIdentity, Versioned};

use crate::ApplyError;

/// Ignore whatever exists and always produce `desired`.
pub fn replace<K: Versioned>(desired: K) -> impl FnMut(K) -> anyhow::Result<K> {
    move |_existing| Ok(desired.clone())
}

/// Invoke `mutate` and make sure it kept the object's identity.
pub(crate) fn run<K, F>(mutate: &mut F, input: K, id: &ObjectIdentity) -> Result<K, ApplyError>
where
    K: Versioned,
    F: FnMut(K) -> anyhow::Result<K>,
{
    let desired = mutate(input).map_err(|e| ApplyError::mutate(id, e))?;
    let got = desired.identity();
    if &got != id {
        return Err(ApplyError::mutate(id, anyhow!("mutate changed object identity to {}", got)));
    }
    Ok(desired)
}

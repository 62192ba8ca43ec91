//! Keel store: in-RAM versioned object store with Kubernetes-like write semantics.
//!
//! Every successful write bumps a store-wide resource version; creates mint a fresh uid.
//! Faults can be injected per verb to exercise the reconcile loops against races and
//! outages without a live cluster.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use keel_core::{ClientError, ObjectIdentity, ResourceClient, Versioned};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

/// Error to inject in place of a real store response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    AlreadyExists,
    Conflict,
    Unavailable(String),
}

impl Fault {
    fn to_error(&self, id: &ObjectIdentity) -> ClientError {
        match self {
            Fault::NotFound => ClientError::NotFound(id.clone()),
            Fault::AlreadyExists => ClientError::AlreadyExists(id.clone()),
            Fault::Conflict => ClientError::Conflict { identity: id.clone(), message: "injected conflict".into() },
            Fault::Unavailable(msg) => ClientError::Other(anyhow!("service unavailable: {}", msg)),
        }
    }
}

/// One recorded client call, in arrival order (faulted calls included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verb: Verb,
    pub identity: ObjectIdentity,
}

struct Inner<K> {
    objects: FxHashMap<ObjectIdentity, K>,
    last_rv: u64,
    fail_once: FxHashMap<Verb, Fault>,
    fail_always: FxHashMap<Verb, Fault>,
    actions: Vec<Action>,
}

impl<K: Versioned> Inner<K> {
    fn bump(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }

    fn record(&mut self, verb: Verb, id: &ObjectIdentity) -> Result<(), ClientError> {
        self.actions.push(Action { verb, identity: id.clone() });
        let fault = self.fail_once.remove(&verb).or_else(|| self.fail_always.get(&verb).cloned());
        match fault {
            Some(f) => {
                debug!(?verb, id = %id, fault = ?f, "injecting fault");
                Err(f.to_error(id))
            }
            None => Ok(()),
        }
    }
}

/// Shared handle to an in-memory store; clones see the same objects.
pub struct MemoryStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
    check_version_on_update: bool,
    latency: Option<Duration>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            check_version_on_update: self.check_version_on_update,
            latency: self.latency,
        }
    }
}

impl<K: Versioned> Default for MemoryStore<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Versioned> MemoryStore<K> {
    pub fn new() -> Self {
        let inner = Inner {
            objects: FxHashMap::default(),
            last_rv: 0,
            fail_once: FxHashMap::default(),
            fail_always: FxHashMap::default(),
            actions: Vec::new(),
        };
        Self { inner: Arc::new(Mutex::new(inner)), check_version_on_update: true, latency: None }
    }

    /// Delay every client call by `latency` before it reaches the store, so concurrent
    /// callers interleave like they would against a remote server.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn round_trip(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Toggle optimistic-concurrency checks on update (on by default).
    pub fn check_version_on_update(mut self, on: bool) -> Self {
        self.check_version_on_update = on;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Fail the next call of `verb` with `fault`.
    pub fn fail_next(&self, verb: Verb, fault: Fault) { self.lock().fail_once.insert(verb, fault); }

    /// Fail every call of `verb` with `fault` until cleared.
    pub fn fail_always(&self, verb: Verb, fault: Fault) { self.lock().fail_always.insert(verb, fault); }

    pub fn clear_faults(&self) {
        let mut g = self.lock();
        g.fail_once.clear();
        g.fail_always.clear();
    }

    /// Insert an object directly (no faults, no action recorded), as an out-of-band writer would.
    pub fn seed(&self, obj: K) -> K {
        let mut g = self.lock();
        let mut stored = obj;
        stored.set_uid(Some(Uuid::new_v4().to_string()));
        let rv = g.bump();
        stored.set_version(Some(rv));
        g.objects.insert(stored.identity(), stored.clone());
        stored
    }

    /// Modify a stored object out of band, bumping its version. Returns the new state.
    pub fn modify(&self, id: &ObjectIdentity, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut g = self.lock();
        let rv = g.bump();
        let obj = g.objects.get_mut(id)?;
        f(obj);
        obj.set_version(Some(rv));
        Some(obj.clone())
    }

    pub fn stored(&self, id: &ObjectIdentity) -> Option<K> { self.lock().objects.get(id).cloned() }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    pub fn actions(&self) -> Vec<Action> { self.lock().actions.clone() }
    pub fn count(&self, verb: Verb) -> usize { self.lock().actions.iter().filter(|a| a.verb == verb).count() }
    pub fn clear_actions(&self) { self.lock().actions.clear(); }
}

#[async_trait::async_trait]
impl<K: Versioned> ResourceClient<K> for MemoryStore<K> {
    async fn get(&self, id: &ObjectIdentity) -> Result<K, ClientError> {
        self.round_trip().await;
        let mut g = self.lock();
        g.record(Verb::Get, id)?;
        g.objects.get(id).cloned().ok_or_else(|| ClientError::NotFound(id.clone()))
    }

    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        self.round_trip().await;
        let id = obj.identity();
        let mut g = self.lock();
        g.record(Verb::Create, &id)?;
        if g.objects.contains_key(&id) {
            return Err(ClientError::AlreadyExists(id));
        }
        let mut stored = obj.clone();
        stored.set_uid(Some(Uuid::new_v4().to_string()));
        let rv = g.bump();
        stored.set_version(Some(rv));
        g.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K, expected_version: &str) -> Result<K, ClientError> {
        self.round_trip().await;
        let id = obj.identity();
        let mut g = self.lock();
        g.record(Verb::Update, &id)?;
        let current = g.objects.get(&id).ok_or_else(|| ClientError::NotFound(id.clone()))?;
        if self.check_version_on_update && !expected_version.is_empty() && current.version() != Some(expected_version) {
            return Err(ClientError::Conflict {
                identity: id,
                message: format!(
                    "the object has been modified (expected version {}, stored {})",
                    expected_version,
                    current.version().unwrap_or("")
                ),
            });
        }
        let current_uid = current.uid().map(str::to_string);
        let mut stored = obj.clone();
        match (stored.uid().map(str::to_string), current_uid) {
            (Some(u), Some(cur)) if u != cur => {
                return Err(ClientError::Conflict {
                    identity: id,
                    message: format!("uid precondition failed (got {}, stored {})", u, cur),
                });
            }
            (None, cur) => stored.set_uid(cur),
            _ => {}
        }
        let rv = g.bump();
        stored.set_version(Some(rv));
        g.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectIdentity) -> Result<(), ClientError> {
        self.round_trip().await;
        let mut g = self.lock();
        g.record(Verb::Delete, id)?;
        match g.objects.remove(id) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(id.clone())),
        }
    }
}

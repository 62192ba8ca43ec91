//! Keel core types: object identity, versioned objects, the remote client contract and errors.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod backoff;

pub use backoff::{duration_ms, BackoffPolicy, PolicyError, Schedule};

/// Read `key` from the environment. Unset yields `None`; an unparsable value is logged
/// and also yields `None`, so callers fall back to their default.
pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

/// Namespace + name of one remote object. Namespace is empty for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self { Self::new(String::new(), name) }

    pub fn is_cluster_scoped(&self) -> bool { self.namespace.is_empty() }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// What a reconcile call did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    /// Desired state was already present; nothing was written.
    Unchanged,
    Created,
    Updated,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Unchanged => "unchanged",
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Discriminant of [`ClientError`], handy for matching without borrowing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Other => "other",
        }
    }
}

/// Errors returned uniformly by every [`ResourceClient`] operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(ObjectIdentity),
    #[error("{0} already exists")]
    AlreadyExists(ObjectIdentity),
    #[error("conflict on {identity}: {message}")]
    Conflict { identity: ObjectIdentity, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotFound(_) => ErrorKind::NotFound,
            ClientError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ClientError::Conflict { .. } => ErrorKind::Conflict,
            ClientError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict { .. }) }
}

/// Capabilities the reconcile loops need from a payload type.
///
/// Every `kube::Resource` that serializes gets this through the blanket impl below, so
/// typed k8s-openapi objects and `DynamicObject` work out of the box.
pub trait Versioned: Clone + Send + Sync + 'static {
    fn identity(&self) -> ObjectIdentity;

    /// Store-assigned unique id of this incarnation of the object.
    fn uid(&self) -> Option<&str>;
    fn set_uid(&mut self, uid: Option<String>);

    /// Opaque resource-version token assigned by the store.
    fn version(&self) -> Option<&str>;
    fn set_version(&mut self, version: Option<String>);

    /// Equality that ignores store-managed metadata (version token, uid, managed fields,
    /// timestamps) and server-populated status.
    fn semantic_eq(&self, other: &Self) -> bool;
}

impl<K> Versioned for K
where
    K: kube::Resource + Serialize + Clone + Send + Sync + 'static,
{
    fn identity(&self) -> ObjectIdentity {
        let meta = self.meta();
        ObjectIdentity::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
    }

    fn uid(&self) -> Option<&str> { self.meta().uid.as_deref() }
    fn set_uid(&mut self, uid: Option<String>) { self.meta_mut().uid = uid; }

    fn version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }
    fn set_version(&mut self, version: Option<String>) { self.meta_mut().resource_version = version; }

    fn semantic_eq(&self, other: &Self) -> bool {
        match (serde_json::to_value(self), serde_json::to_value(other)) {
            (Ok(a), Ok(b)) => strip_managed(a) == strip_managed(b),
            // Unserializable payloads are never considered equal; the caller then writes.
            _ => false,
        }
    }
}

/// Drop store-managed metadata and status from a serialized object.
pub fn strip_managed(mut v: serde_json::Value) -> serde_json::Value {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Get/Create/Update/Delete against one object identity of a remote versioned store.
#[async_trait::async_trait]
pub trait ResourceClient<K: Versioned>: Send + Sync {
    /// `ClientError::NotFound` when absent.
    async fn get(&self, id: &ObjectIdentity) -> Result<K, ClientError>;

    /// `ClientError::AlreadyExists` when the identity is already taken.
    async fn create(&self, obj: &K) -> Result<K, ClientError>;

    /// Optimistic update: `ClientError::Conflict` when `expected_version` no longer matches.
    /// An empty `expected_version` writes unconditionally.
    async fn update(&self, obj: &K, expected_version: &str) -> Result<K, ClientError>;

    /// `ClientError::NotFound` when already absent.
    async fn delete(&self, id: &ObjectIdentity) -> Result<(), ClientError>;
}

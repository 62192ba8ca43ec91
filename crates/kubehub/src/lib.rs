//! Keel kubehub: `ResourceClient` over kube-rs, discovery and error classification.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use keel_core::{ClientError, ObjectIdentity, ResourceClient, Versioned};
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

pub mod manifest;

pub use manifest::Manifest;

/// Connect using the ambient kubeconfig or in-cluster environment.
pub async fn kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    info!(namespace = %client.default_namespace(), "kube client ready");
    Ok(client)
}

/// Map a kube-rs error onto the closed client error variant.
pub fn classify(err: kube::Error, id: &ObjectIdentity) -> ClientError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClientError::AlreadyExists(id.clone()),
        // Any other 409 is an optimistic-concurrency rejection ("Conflict").
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict { identity: id.clone(), message: ae.message },
        other => ClientError::Other(anyhow::Error::new(other)),
    }
}

/// `ResourceClient` backed by a kube `Api<K>` scoped to the objects' namespace
/// (or cluster-wide for cluster-scoped kinds).
pub struct KubeClient<K> {
    api: Api<K>,
    field_manager: Option<String>,
}

impl<K> KubeClient<K> {
    pub fn new(api: Api<K>) -> Self { Self { api, field_manager: None } }

    /// Record writes under the given field manager.
    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = Some(manager.into());
        self
    }

    fn post_params(&self) -> PostParams { post_params(self.field_manager.as_deref()) }
}

fn post_params(field_manager: Option<&str>) -> PostParams {
    let mut pp = PostParams::default();
    pp.field_manager = field_manager.map(str::to_string);
    pp
}

#[async_trait::async_trait]
impl<K> ResourceClient<K> for KubeClient<K>
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, id: &ObjectIdentity) -> Result<K, ClientError> {
        counter!("keel_kube_requests", 1u64, "verb" => "get");
        self.api.get(&id.name).await.map_err(|e| classify(e, id))
    }

    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        let id = obj.identity();
        counter!("keel_kube_requests", 1u64, "verb" => "create");
        self.api.create(&self.post_params(), obj).await.map_err(|e| classify(e, &id))
    }

    async fn update(&self, obj: &K, expected_version: &str) -> Result<K, ClientError> {
        let id = obj.identity();
        counter!("keel_kube_requests", 1u64, "verb" => "update");
        let mut body = obj.clone();
        body.set_version(if expected_version.is_empty() { None } else { Some(expected_version.to_string()) });
        self.api.replace(&id.name, &self.post_params(), &body).await.map_err(|e| classify(e, &id))
    }

    async fn delete(&self, id: &ObjectIdentity) -> Result<(), ClientError> {
        counter!("keel_kube_requests", 1u64, "verb" => "delete");
        let res = self.api.delete(&id.name, &DeleteParams::default()).await.map_err(|e| classify(e, id))?;
        debug!(id = %id, pending = res.is_left(), "delete accepted");
        Ok(())
    }
}

/// Resolve the manifest's kind through discovery and build a dynamic client for it.
/// Namespaced kinds without a namespace land in the client's default namespace;
/// cluster-scoped kinds drop any namespace they were given.
pub async fn dynamic_client(client: Client, manifest: &mut Manifest) -> Result<KubeClient<DynamicObject>> {
    let (ar, namespaced) = find_api_resource(client.clone(), &manifest.gvk).await?;
    let api: Api<DynamicObject> = if namespaced {
        if manifest.identity.is_cluster_scoped() {
            manifest.set_namespace(Some(client.default_namespace()));
        }
        Api::namespaced_with(client, &manifest.identity.namespace, &ar)
    } else {
        manifest.set_namespace(None);
        Api::all_with(client, &ar)
    };
    debug!(id = %manifest.identity, kind = %ar.kind, namespaced, "dynamic client ready");
    Ok(KubeClient::new(api))
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

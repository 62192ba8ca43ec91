//! Single-document YAML manifests turned into `DynamicObject`s.

use anyhow::{anyhow, Context, Result};
use keel_core::{env_parse, ObjectIdentity};
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value as Json;

const DEFAULT_MAX_YAML_BYTES: usize = 1_000_000;
const DEFAULT_MAX_YAML_NODES: usize = 100_000;

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// A parsed manifest: its kind, identity and payload.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub gvk: GroupVersionKind,
    pub identity: ObjectIdentity,
    pub object: DynamicObject,
}

impl Manifest {
    /// Parse one YAML document. `ns_override` replaces `metadata.namespace`.
    pub fn from_yaml(yaml: &str, ns_override: Option<&str>) -> Result<Self> {
        let max_bytes = env_parse("KEEL_MAX_YAML_BYTES").unwrap_or(DEFAULT_MAX_YAML_BYTES);
        let max_nodes = env_parse("KEEL_MAX_YAML_NODES").unwrap_or(DEFAULT_MAX_YAML_NODES);
        Self::from_yaml_with_limits(yaml, ns_override, max_bytes, max_nodes)
    }

    fn from_yaml_with_limits(yaml: &str, ns_override: Option<&str>, max_bytes: usize, max_nodes: usize) -> Result<Self> {
        if yaml.len() > max_bytes {
            return Err(anyhow!("YAML payload too large (>{} bytes)", max_bytes));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
        let mut json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_nodes) {
            return Err(anyhow!("YAML document too complex (>{} nodes)", max_nodes));
        }
        let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?.to_string();
        let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?.to_string();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version),
        };
        let name = json
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("YAML missing metadata.name"))?
            .to_string();
        if let Some(ns) = ns_override {
            if let Some(meta) = json.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
        }
        let namespace = json
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let object: DynamicObject = serde_json::from_value(json).context("decoding manifest object")?;
        Ok(Self {
            gvk: GroupVersionKind { group, version, kind },
            identity: ObjectIdentity::new(namespace, name),
            object,
        })
    }

    /// Move the object to `ns`, or make it cluster-scoped with `None`.
    pub fn set_namespace(&mut self, ns: Option<&str>) {
        self.object.metadata.namespace = ns.map(str::to_string);
        self.identity.namespace = ns.unwrap_or_default().to_string();
    }
}

//! Coral kube integration: the CRUD/discovery seam the reconciler talks
//! through, plus the per-pass capability table.
//!
//! Everything crosses this boundary as a raw JSON document so the one trait
//! covers stock kinds, CRDs the platform may or may not serve (routes,
//! certificates, service monitors, binding resources) and the Component
//! itself. [`KubeHub`] is the live implementation; [`mem::MemClient`] backs
//! the test suites.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::debug;

use coral_core::{Error, Result};

pub mod mem;

/// Canonical key for a GVK: `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(Error::Invalid(format!(
            "invalid gvk key: {key} (expect v1/Kind or group/v1/Kind)"
        ))),
    }
}

/// GVKs of every document kind the reconciler reads or writes.
pub mod kinds {
    use kube::core::GroupVersionKind;

    pub fn component() -> GroupVersionKind {
        GroupVersionKind::gvk("coral.dev", "v1alpha1", "Component")
    }
    pub fn deployment() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }
    pub fn stateful_set() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "StatefulSet")
    }
    /// Serverless workload shape (Knative serving).
    pub fn serverless_service() -> GroupVersionKind {
        GroupVersionKind::gvk("serving.knative.dev", "v1", "Service")
    }
    pub fn service() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Service")
    }
    pub fn secret() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Secret")
    }
    pub fn service_account() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ServiceAccount")
    }
    pub fn config_map() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }
    pub fn event() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Event")
    }
    pub fn route() -> GroupVersionKind {
        GroupVersionKind::gvk("route.openshift.io", "v1", "Route")
    }
    pub fn ingress() -> GroupVersionKind {
        GroupVersionKind::gvk("networking.k8s.io", "v1", "Ingress")
    }
    pub fn autoscaler() -> GroupVersionKind {
        GroupVersionKind::gvk("autoscaling", "v2", "HorizontalPodAutoscaler")
    }
    pub fn service_monitor() -> GroupVersionKind {
        GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor")
    }
    pub fn certificate() -> GroupVersionKind {
        GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate")
    }
    pub fn image_stream_tag() -> GroupVersionKind {
        GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStreamTag")
    }
}

/// Namespaced CRUD plus cluster-scope discovery, as JSON documents.
///
/// `get` answers `Ok(None)` for absent objects; `update`/`delete` of a
/// missing object and writes losing an optimistic-concurrency race surface
/// as classified [`Error`]s.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<Option<Json>>;
    async fn create(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json>;
    async fn update(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json>;
    async fn delete(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<()>;
    /// Write the status subresource of an existing document.
    async fn update_status(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json>;
    /// Whether the platform serves this kind. "Not found" is `false`, not
    /// an error.
    async fn discover(&self, gvk: &GroupVersionKind) -> Result<bool>;
}

/// Per-pass memo over [`DocumentClient::discover`]. Never shared across
/// passes so capability decisions cannot go stale.
#[derive(Default)]
pub struct Capabilities {
    memo: FxHashMap<String, bool>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn supports(
        &mut self,
        client: &dyn DocumentClient,
        gvk: &GroupVersionKind,
    ) -> Result<bool> {
        let key = gvk_key(gvk);
        if let Some(&hit) = self.memo.get(&key) {
            return Ok(hit);
        }
        let installed = client.discover(gvk).await?;
        debug!(gvk = %key, installed, "capability probed");
        self.memo.insert(key, installed);
        Ok(installed)
    }
}

/// Live client: kube dynamic APIs with server-side resource resolution.
pub struct KubeHub {
    client: Client,
    // ApiResource per GVK; plural/scope come from the server, not guessed.
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Transient(anyhow!(e).context("building kube client")))?;
        Ok(Self::new(client))
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.resources.read().await.get(&key) {
            return Ok(Some(hit.clone()));
        }
        match kube::discovery::pinned_kind(&self.client, gvk).await {
            Ok((ar, caps)) => {
                let namespaced = matches!(caps.scope, kube::discovery::Scope::Namespaced);
                self.resources
                    .write()
                    .await
                    .insert(key, (ar.clone(), namespaced));
                Ok(Some((ar, namespaced)))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::Transient(
                anyhow!(e).context(format!("discovering {key}")),
            )),
        }
    }

    async fn api_for(&self, gvk: &GroupVersionKind, ns: &str) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self
            .resolve(gvk)
            .await?
            .ok_or_else(|| Error::MissingDependency(format!("kind {} not served", gvk_key(gvk))))?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

fn classify(e: kube::Error, what: &str) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(what.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => Error::MissingDependency(what.to_string()),
        other => Error::Transient(anyhow!(other).context(what.to_string())),
    }
}

fn as_dynamic(doc: &Json) -> Result<DynamicObject> {
    serde_json::from_value(doc.clone())
        .context("document is not a valid object")
        .map_err(Error::Transient)
}

fn doc_name(doc: &Json) -> Result<String> {
    doc.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Invalid("document missing metadata.name".into()))
}

#[async_trait]
impl DocumentClient for KubeHub {
    async fn get(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<Option<Json>> {
        let api = self.api_for(gvk, ns).await?;
        let what = format!("{}/{}/{}", gvk_key(gvk), ns, name);
        match api.get_opt(name).await {
            Ok(Some(obj)) => Ok(Some(
                serde_json::to_value(&obj)
                    .context("serializing object")
                    .map_err(Error::Transient)?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(classify(e, &what)),
        }
    }

    async fn create(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let api = self.api_for(gvk, ns).await?;
        let name = doc_name(doc)?;
        let what = format!("{}/{}/{}", gvk_key(gvk), ns, name);
        metrics::counter!("kube_creates", 1u64);
        let created = api
            .create(&PostParams::default(), &as_dynamic(doc)?)
            .await
            .map_err(|e| classify(e, &what))?;
        serde_json::to_value(&created)
            .context("serializing created object")
            .map_err(Error::Transient)
    }

    async fn update(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let api = self.api_for(gvk, ns).await?;
        let name = doc_name(doc)?;
        let what = format!("{}/{}/{}", gvk_key(gvk), ns, name);
        metrics::counter!("kube_updates", 1u64);
        let updated = api
            .replace(&name, &PostParams::default(), &as_dynamic(doc)?)
            .await
            .map_err(|e| classify(e, &what))?;
        serde_json::to_value(&updated)
            .context("serializing updated object")
            .map_err(Error::Transient)
    }

    async fn delete(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<()> {
        let api = self.api_for(gvk, ns).await?;
        let what = format!("{}/{}/{}", gvk_key(gvk), ns, name);
        metrics::counter!("kube_deletes", 1u64);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, &what))?;
        Ok(())
    }

    async fn update_status(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let api = self.api_for(gvk, ns).await?;
        let name = doc_name(doc)?;
        let what = format!("{}/{}/{} status", gvk_key(gvk), ns, name);
        let bytes = serde_json::to_vec(doc)
            .context("serializing status document")
            .map_err(Error::Transient)?;
        let updated = api
            .replace_status(&name, &PostParams::default(), bytes)
            .await
            .map_err(|e| classify(e, &what))?;
        serde_json::to_value(&updated)
            .context("serializing updated object")
            .map_err(Error::Transient)
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.resolve(gvk).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_round_trip() {
        for key in ["v1/Secret", "apps/v1/Deployment", "cert-manager.io/v1/Certificate"] {
            let gvk = parse_gvk_key(key).unwrap();
            assert_eq!(gvk_key(&gvk), key);
        }
        assert!(parse_gvk_key("Deployment").is_err());
    }

    #[tokio::test]
    async fn capability_table_memoizes_per_instance() {
        let client = mem::MemClient::default();
        client.support(&kinds::route());
        let mut caps = Capabilities::new();
        assert!(caps.supports(&client, &kinds::route()).await.unwrap());
        assert!(!caps.supports(&client, &kinds::ingress()).await.unwrap());
        // A capability installed mid-pass is not observed until a new table.
        client.support(&kinds::ingress());
        assert!(!caps.supports(&client, &kinds::ingress()).await.unwrap());
        let mut fresh = Capabilities::new();
        assert!(fresh.supports(&client, &kinds::ingress()).await.unwrap());
    }
}

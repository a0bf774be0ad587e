//! In-memory [`DocumentClient`](crate::DocumentClient) used by the test
//! suites: a plain document store with capability toggles and a mutation
//! counter so tests can assert that a converged pass writes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::GroupVersionKind;
use serde_json::Value as Json;

use coral_core::{Error, Result};

use crate::{gvk_key, DocumentClient};

type Key = (String, String, String); // (gvk key, namespace, name)

#[derive(Default)]
pub struct MemClient {
    docs: Mutex<BTreeMap<Key, Json>>,
    supported: Mutex<BTreeSet<String>>,
    writes: AtomicU64,
    seq: AtomicU64,
}

impl MemClient {
    /// Mark a kind as served by the fake platform.
    pub fn support(&self, gvk: &GroupVersionKind) {
        self.supported.lock().unwrap().insert(gvk_key(gvk));
    }

    /// Seed a document without counting it as a reconcile write.
    pub fn put(&self, gvk: &GroupVersionKind, ns: &str, mut doc: Json) {
        let name = doc["metadata"]["name"]
            .as_str()
            .expect("seed document needs metadata.name")
            .to_string();
        self.stamp(&mut doc);
        doc["metadata"]["namespace"] = Json::String(ns.to_string());
        self.docs
            .lock()
            .unwrap()
            .insert((gvk_key(gvk), ns.to_string(), name), doc);
    }

    /// Remove a document out-of-band (e.g. "the provider secret was
    /// deleted"), without counting a write.
    pub fn remove(&self, gvk: &GroupVersionKind, ns: &str, name: &str) {
        self.docs
            .lock()
            .unwrap()
            .remove(&(gvk_key(gvk), ns.to_string(), name.to_string()));
    }

    pub fn doc(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Option<Json> {
        self.docs
            .lock()
            .unwrap()
            .get(&(gvk_key(gvk), ns.to_string(), name.to_string()))
            .cloned()
    }

    pub fn exists(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> bool {
        self.doc(gvk, ns, name).is_some()
    }

    /// Number of mutations (create/update/delete/status) performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn stamp(&self, doc: &mut Json) {
        let meta = doc["metadata"]
            .as_object_mut()
            .expect("document metadata must be an object");
        if !meta.contains_key("uid") {
            let n = self.seq.fetch_add(1, Ordering::SeqCst);
            meta.insert("uid".into(), Json::String(format!("mem-uid-{n}")));
        }
        let rv = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        meta.insert("resourceVersion".into(), Json::String((rv + 1).to_string()));
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn what(gvk: &GroupVersionKind, ns: &str, name: &str) -> String {
    format!("{}/{}/{}", gvk_key(gvk), ns, name)
}

#[async_trait]
impl DocumentClient for MemClient {
    async fn get(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<Option<Json>> {
        Ok(self.doc(gvk, ns, name))
    }

    async fn create(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let name = doc["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::Invalid("document missing metadata.name".into()))?
            .to_string();
        let key = (gvk_key(gvk), ns.to_string(), name.clone());
        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(&key) {
            return Err(Error::Conflict(what(gvk, ns, &name)));
        }
        let mut stored = doc.clone();
        self.stamp(&mut stored);
        stored["metadata"]["namespace"] = Json::String(ns.to_string());
        docs.insert(key, stored.clone());
        self.count_write();
        Ok(stored)
    }

    async fn update(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let name = doc["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::Invalid("document missing metadata.name".into()))?
            .to_string();
        let key = (gvk_key(gvk), ns.to_string(), name.clone());
        let mut docs = self.docs.lock().unwrap();
        if !docs.contains_key(&key) {
            return Err(Error::MissingDependency(what(gvk, ns, &name)));
        }
        let mut stored = doc.clone();
        self.stamp(&mut stored);
        docs.insert(key, stored.clone());
        self.count_write();
        Ok(stored)
    }

    async fn delete(&self, gvk: &GroupVersionKind, ns: &str, name: &str) -> Result<()> {
        let key = (gvk_key(gvk), ns.to_string(), name.to_string());
        let mut docs = self.docs.lock().unwrap();
        if docs.remove(&key).is_none() {
            return Err(Error::MissingDependency(what(gvk, ns, name)));
        }
        self.count_write();
        Ok(())
    }

    async fn update_status(&self, gvk: &GroupVersionKind, ns: &str, doc: &Json) -> Result<Json> {
        let name = doc["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::Invalid("document missing metadata.name".into()))?
            .to_string();
        let key = (gvk_key(gvk), ns.to_string(), name.clone());
        let mut docs = self.docs.lock().unwrap();
        let stored = docs
            .get_mut(&key)
            .ok_or_else(|| Error::MissingDependency(what(gvk, ns, &name)))?;
        stored["status"] = doc.get("status").cloned().unwrap_or(Json::Null);
        let mut updated = stored.clone();
        self.stamp(&mut updated);
        *stored = updated.clone();
        self.count_write();
        Ok(updated)
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.supported.lock().unwrap().contains(&gvk_key(gvk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds;

    #[tokio::test]
    async fn create_then_update_counts_writes() {
        let client = MemClient::default();
        let doc = serde_json::json!({"metadata": {"name": "x"}, "data": {"k": "v"}});
        client.create(&kinds::secret(), "ns", &doc).await.unwrap();
        assert!(matches!(
            client.create(&kinds::secret(), "ns", &doc).await,
            Err(Error::Conflict(_))
        ));
        let mut stored = client.doc(&kinds::secret(), "ns", "x").unwrap();
        stored["data"]["k"] = serde_json::json!("v2");
        client.update(&kinds::secret(), "ns", &stored).await.unwrap();
        assert_eq!(client.writes(), 2);
        assert!(matches!(
            client.delete(&kinds::secret(), "ns", "gone").await,
            Err(Error::MissingDependency(_))
        ));
    }
}

//! Idempotent child-document writes and JSON metadata helpers.
//!
//! `upsert` is the only way the reconciler creates or updates children: it
//! overlays the desired document onto the live one and skips the write when
//! nothing changed, which is what makes a converged pass a no-op fixed
//! point.

#![forbid(unsafe_code)]

use kube::core::GroupVersionKind;
use metrics::counter;
use serde_json::{Map, Value as Json};
use tracing::debug;

use coral_core::{Error, Result};
use coral_kubehub::{gvk_key, DocumentClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

pub fn name_of(doc: &Json) -> Result<&str> {
    doc.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Invalid("document missing metadata.name".into()))
}

fn ensure_metadata(doc: &mut Json, name: &str, ns: &str) {
    let meta = doc
        .as_object_mut()
        .expect("documents are JSON objects")
        .entry("metadata")
        .or_insert(Json::Object(Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        obj.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

/// Overlay `desired` onto `existing`: desired top-level sections replace the
/// live ones, labels/annotations merge per key (desired wins), owner
/// references replace only when desired carries any. Server bookkeeping
/// (resourceVersion, uid, status) is untouched.
pub fn merge_desired(existing: &Json, desired: &Json) -> Json {
    let mut out = existing.clone();
    let (Some(out_obj), Some(des_obj)) = (out.as_object_mut(), desired.as_object()) else {
        return out;
    };
    for (k, v) in des_obj {
        match k.as_str() {
            "apiVersion" | "kind" | "status" => {}
            "metadata" => {
                let meta = out_obj.entry("metadata").or_insert(Json::Object(Map::new()));
                merge_metadata(meta, v);
            }
            _ => {
                out_obj.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

fn merge_metadata(live: &mut Json, desired: &Json) {
    let (Some(live_obj), Some(des_obj)) = (live.as_object_mut(), desired.as_object()) else {
        return;
    };
    for key in ["labels", "annotations"] {
        if let Some(des_map) = des_obj.get(key).and_then(|v| v.as_object()) {
            let slot = live_obj
                .entry(key)
                .or_insert(Json::Object(Map::new()));
            if let Some(live_map) = slot.as_object_mut() {
                for (k, v) in des_map {
                    live_map.insert(k.clone(), v.clone());
                }
            }
        }
    }
    if let Some(owners) = des_obj.get("ownerReferences") {
        live_obj.insert("ownerReferences".into(), owners.clone());
    }
}

/// Create the document, or update it only when the desired overlay changes
/// the live object.
pub async fn upsert(
    client: &dyn DocumentClient,
    gvk: &GroupVersionKind,
    ns: &str,
    desired: &Json,
) -> Result<Applied> {
    let name = name_of(desired)?.to_string();
    let mut desired = desired.clone();
    ensure_metadata(&mut desired, &name, ns);
    match client.get(gvk, ns, &name).await? {
        None => {
            client.create(gvk, ns, &desired).await?;
            counter!("child_creates", 1u64);
            debug!(gvk = %gvk_key(gvk), ns, name = %name, "created");
            Ok(Applied::Created)
        }
        Some(existing) => {
            let merged = merge_desired(&existing, &desired);
            if merged == existing {
                counter!("child_noops", 1u64);
                return Ok(Applied::Unchanged);
            }
            client.update(gvk, ns, &merged).await?;
            counter!("child_updates", 1u64);
            debug!(gvk = %gvk_key(gvk), ns, name = %name, "updated");
            Ok(Applied::Updated)
        }
    }
}

/// Delete the document if it exists. Returns whether anything was deleted;
/// losing a delete race to the garbage collector is not an error.
pub async fn delete_if_present(
    client: &dyn DocumentClient,
    gvk: &GroupVersionKind,
    ns: &str,
    name: &str,
) -> Result<bool> {
    if client.get(gvk, ns, name).await?.is_none() {
        return Ok(false);
    }
    match client.delete(gvk, ns, name).await {
        Ok(()) => {
            counter!("child_deletes", 1u64);
            debug!(gvk = %gvk_key(gvk), ns, name, "deleted");
            Ok(true)
        }
        Err(Error::MissingDependency(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

// ---- annotations ----

pub fn annotation<'a>(doc: &'a Json, key: &str) -> Option<&'a str> {
    doc.get("metadata")?
        .get("annotations")?
        .get(key)?
        .as_str()
}

pub fn set_annotation(doc: &mut Json, key: &str, value: &str) {
    let meta = doc
        .as_object_mut()
        .expect("documents are JSON objects")
        .entry("metadata")
        .or_insert(Json::Object(Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        let annos = obj
            .entry("annotations")
            .or_insert(Json::Object(Map::new()));
        if let Some(map) = annos.as_object_mut() {
            map.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

/// Read a comma-separated list annotation, trimmed, empties dropped.
pub fn list_annotation(doc: &Json, key: &str) -> Vec<String> {
    annotation(doc, key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Merge `value` into a comma-separated list annotation, deduplicated and
/// sorted. Returns whether the document changed.
pub fn merge_list_annotation(doc: &mut Json, key: &str, value: &str) -> bool {
    let mut items = list_annotation(doc, key);
    if items.iter().any(|s| s == value) {
        return false;
    }
    items.push(value.to_string());
    items.sort();
    set_annotation(doc, key, &items.join(","));
    true
}

// ---- owner references ----

/// Controller owner reference pointing at a Component.
pub fn component_owner_reference(owner_name: &str, owner_uid: &str) -> Json {
    serde_json::json!({
        "apiVersion": "coral.dev/v1alpha1",
        "kind": "Component",
        "name": owner_name,
        "uid": owner_uid,
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

/// Replace the document's controller reference with one pointing at the
/// Component. Returns whether the document changed.
pub fn set_component_owner(doc: &mut Json, owner_name: &str, owner_uid: &str) -> bool {
    let desired = Json::Array(vec![component_owner_reference(owner_name, owner_uid)]);
    let meta = doc
        .as_object_mut()
        .expect("documents are JSON objects")
        .entry("metadata")
        .or_insert(Json::Object(Map::new()));
    let Some(obj) = meta.as_object_mut() else { return false };
    if obj.get("ownerReferences") == Some(&desired) {
        return false;
    }
    obj.insert("ownerReferences".into(), desired);
    true
}

/// Whether this document is controlled by the named Component. The uid is
/// only compared when both sides carry one.
pub fn is_owned_by_component(doc: &Json, owner_name: &str, owner_uid: &str) -> bool {
    let Some(refs) = doc
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|v| v.as_array())
    else {
        return false;
    };
    refs.iter().any(|r| {
        r.get("kind").and_then(|v| v.as_str()) == Some("Component")
            && r.get("name").and_then(|v| v.as_str()) == Some(owner_name)
            && match (r.get("uid").and_then(|v| v.as_str()), owner_uid) {
                (Some(u), o) if !u.is_empty() && !o.is_empty() => u == o,
                _ => true,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_kubehub::{kinds, mem::MemClient};

    fn secret(name: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name, "labels": {"app.kubernetes.io/managed-by": "coral-operator"}},
            "data": {"url": "aHR0cDovL3g="},
        })
    }

    #[tokio::test]
    async fn upsert_is_a_fixed_point() {
        let client = MemClient::default();
        let gvk = kinds::secret();
        assert_eq!(upsert(&client, &gvk, "ns", &secret("s")).await.unwrap(), Applied::Created);
        assert_eq!(upsert(&client, &gvk, "ns", &secret("s")).await.unwrap(), Applied::Unchanged);
        assert_eq!(client.writes(), 1);

        let mut changed = secret("s");
        changed["data"]["url"] = Json::String("aHR0cDovL3k=".into());
        assert_eq!(upsert(&client, &gvk, "ns", &changed).await.unwrap(), Applied::Updated);
        assert_eq!(client.writes(), 2);
    }

    #[tokio::test]
    async fn merge_keeps_server_side_fields_and_foreign_labels() {
        let client = MemClient::default();
        let gvk = kinds::secret();
        let mut live = secret("s");
        live["metadata"]["labels"]["team"] = Json::String("payments".into());
        client.put(&gvk, "ns", live);

        upsert(&client, &gvk, "ns", &secret("s")).await.unwrap();
        let stored = client.doc(&gvk, "ns", "s").unwrap();
        assert_eq!(stored["metadata"]["labels"]["team"], "payments");
        assert!(stored["metadata"]["uid"].as_str().is_some());
        assert_eq!(client.writes(), 0);
    }

    #[tokio::test]
    async fn delete_if_present_reports_absence() {
        let client = MemClient::default();
        let gvk = kinds::secret();
        assert!(!delete_if_present(&client, &gvk, "ns", "s").await.unwrap());
        client.put(&gvk, "ns", secret("s"));
        assert!(delete_if_present(&client, &gvk, "ns", "s").await.unwrap());
        assert!(!client.exists(&gvk, "ns", "s"));
    }

    #[test]
    fn list_annotations_merge_sorted_and_deduped() {
        let mut doc = secret("s");
        assert!(merge_list_annotation(&mut doc, "k", "ns-b"));
        assert!(merge_list_annotation(&mut doc, "k", "ns-a"));
        assert!(!merge_list_annotation(&mut doc, "k", "ns-b"));
        assert_eq!(annotation(&doc, "k"), Some("ns-a,ns-b"));
        assert_eq!(list_annotation(&doc, "k"), vec!["ns-a", "ns-b"]);
    }

    #[test]
    fn owner_matching_tolerates_missing_uids()  {
        let mut doc = secret("s");
        assert!(set_component_owner(&mut doc, "web", "uid-1"));
        assert!(!set_component_owner(&mut doc, "web", "uid-1"));
        assert!(is_owned_by_component(&doc, "web", "uid-1"));
        assert!(is_owned_by_component(&doc, "web", ""));
        assert!(!is_owned_by_component(&doc, "web", "uid-2"));
        assert!(!is_owned_by_component(&doc, "api", "uid-1"));
    }
}

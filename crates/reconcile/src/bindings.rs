//! Service binding resolution: the produce / consume / bindings protocols.
//!
//! Produce publishes a binding secret describing this component's service.
//! Consume mirrors other components' binding secrets into this namespace,
//! maintaining the bookkeeping annotations on both sides. Bindings resolves
//! an embedded, referenced or auto-detected binding resource to its secret.
//! All three address their documents by deterministic names; none of them
//! lists anything.

use base64::Engine;
use k8s_openapi::api::core::v1::SecretKeySelector;
use kube::core::GroupVersionKind;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, warn};

use coral_apply::{
    component_owner_reference, delete_if_present, is_owned_by_component, list_annotation,
    merge_list_annotation, set_component_owner, upsert,
};
use coral_core::{Error, Result};
use coral_kubehub::{gvk_key, kinds, parse_gvk_key, Capabilities, DocumentClient};
use coral_model::{ComponentStatus, BINDING_CATEGORY_OPENAPI};

use crate::names;
use crate::resources;
use crate::PassCtx;

/// Producer-side list of namespaces the binding secret was mirrored into.
pub const COPIED_TO_NAMESPACES: &str = "service.coral.dev/copied-to-namespaces";
/// Consumer-side list of component names using a mirrored copy.
pub const CONSUMED_BY: &str = "service.coral.dev/consumed-by";

/// How the consumed-secret wiring reaches the pod template.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BindingWiring {
    /// Secrets injected through `envFrom`.
    pub env_from_secrets: Vec<String>,
    /// Secrets mounted as files: (secret name, mount path).
    pub mounted_secrets: Vec<(String, String)>,
}

/// What happens to the mirror's owner reference. Kubernetes forbids owner
/// references across namespaces, so the consumer may only own the copy when
/// the copy actually lives in its own namespace and the producer does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOwner {
    /// Same namespace: the "mirror" is the producer secret itself.
    KeepProducer,
    /// Distinct namespaces: the copy is owned by the consumer so garbage
    /// collection removes it with the consumer.
    OwnByConsumer,
}

pub fn mirror_owner_action(same_namespace: bool) -> MirrorOwner {
    if same_namespace {
        MirrorOwner::KeepProducer
    } else {
        MirrorOwner::OwnByConsumer
    }
}

/// Run produce, consume and bindings in that fixed order. The resolved
/// binding list lands sorted in `status.resolvedBindings`; consumed mirrors
/// land in `status.consumedServices`.
pub async fn reconcile(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    caps: &mut Capabilities,
    status: &mut ComponentStatus,
) -> Result<BindingWiring> {
    produce(ctx, client).await?;
    let mut wiring = consume(ctx, client, status).await?;

    let mut resolved = resolve_bindings(ctx, client, caps).await?;
    for secret in &resolved {
        if !wiring.env_from_secrets.iter().any(|s| s == secret) {
            wiring.env_from_secrets.push(secret.clone());
        }
    }
    resolved.sort();
    if status.resolved_bindings != resolved {
        status.resolved_bindings = resolved;
    }
    Ok(wiring)
}

// ---- produce ----

async fn produce(ctx: &PassCtx<'_>, client: &dyn DocumentClient) -> Result<()> {
    let secret_name = names::provider_secret(ctx.name, ctx.ns);
    let provides = ctx
        .comp
        .spec
        .provides()
        .filter(|p| p.category == BINDING_CATEGORY_OPENAPI);

    let Some(provides) = provides else {
        return teardown_provider(ctx, client, &secret_name).await;
    };

    let hostname = format!("{}.{}.svc.cluster.local", ctx.name, ctx.ns);
    let protocol = provides.protocol.as_deref().unwrap_or("http");
    let port = ctx.comp.spec.service_port();
    let context = normalize_context(provides.context.as_deref());
    let url = format!("{protocol}://{hostname}:{port}{context}");

    let mut data = Map::new();
    data.insert("hostname".into(), b64(&hostname));
    data.insert("protocol".into(), b64(protocol));
    data.insert("port".into(), b64(&port.to_string()));
    data.insert("context".into(), b64(&context));
    data.insert("url".into(), b64(&url));
    if let Some(auth) = &provides.auth {
        if let Some(sel) = &auth.username {
            data.insert("username".into(), credential(ctx, client, sel).await?);
        }
        if let Some(sel) = &auth.password {
            data.insert("password".into(), credential(ctx, client, sel).await?);
        }
    }

    let desired = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": secret_name,
            "namespace": ctx.ns,
            "labels": resources::labels(ctx),
            "ownerReferences": [component_owner_reference(ctx.name, ctx.uid)],
        },
        "data": data,
    });
    upsert(client, &kinds::secret(), ctx.ns, &desired).await?;
    Ok(())
}

/// The provider descriptor is gone: remove every mirrored copy recorded on
/// the secret, then the secret itself. A same-named secret this component
/// never owned is left alone.
async fn teardown_provider(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    secret_name: &str,
) -> Result<()> {
    let Some(existing) = client.get(&kinds::secret(), ctx.ns, secret_name).await? else {
        return Ok(());
    };
    if !is_owned_by_component(&existing, ctx.name, ctx.uid) {
        return Ok(());
    }
    for target_ns in list_annotation(&existing, COPIED_TO_NAMESPACES) {
        if target_ns != ctx.ns {
            delete_if_present(client, &kinds::secret(), &target_ns, secret_name).await?;
        }
    }
    delete_if_present(client, &kinds::secret(), ctx.ns, secret_name).await?;
    debug!(secret = %secret_name, "provider secret and mirrors torn down");
    Ok(())
}

async fn credential(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    selector: &SecretKeySelector,
) -> Result<Json> {
    let name = selector
        .name
        .as_deref()
        .ok_or_else(|| Error::Invalid("credential selector needs a secret name".into()))?;
    let secret = client
        .get(&kinds::secret(), ctx.ns, name)
        .await?
        .ok_or_else(|| {
            Error::MissingDependency(format!("credential secret {}/{name}", ctx.ns))
        })?;
    secret
        .pointer(&format!("/data/{}", selector.key))
        .cloned()
        .ok_or_else(|| {
            Error::MissingDependency(format!(
                "key {} in credential secret {}/{name}",
                selector.key, ctx.ns
            ))
        })
}

fn normalize_context(context: Option<&str>) -> String {
    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) if c.starts_with('/') => c.to_string(),
        Some(c) => format!("/{c}"),
        None => "/".to_string(),
    }
}

fn b64(value: &str) -> Json {
    Json::String(base64::engine::general_purpose::STANDARD.encode(value))
}

// ---- consume ----

async fn consume(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    status: &mut ComponentStatus,
) -> Result<BindingWiring> {
    let mut wiring = BindingWiring::default();
    for consumed in ctx.comp.spec.consumes() {
        if consumed.category() != BINDING_CATEGORY_OPENAPI {
            warn!(service = %consumed.name, category = %consumed.category(), "unsupported binding category, skipping");
            continue;
        }
        let provider_ns = consumed.namespace.as_deref().unwrap_or(ctx.ns);
        let secret_name = names::provider_secret(&consumed.name, provider_ns);

        let provider = client
            .get(&kinds::secret(), provider_ns, &secret_name)
            .await?;
        let Some(mut provider) = provider else {
            return Err(missing_provider(ctx, client, provider_ns, &secret_name).await);
        };

        // Record this namespace on the producer before the copy exists, so a
        // teardown racing this pass still finds the copy to delete.
        if merge_list_annotation(&mut provider, COPIED_TO_NAMESPACES, ctx.ns) {
            client.update(&kinds::secret(), provider_ns, &provider).await?;
        }

        mirror(ctx, client, provider_ns, &secret_name, &provider).await?;
        status.record_consumed(consumed.category(), &secret_name);

        match &consumed.mount_path {
            Some(path) => wiring.mounted_secrets.push((secret_name, path.clone())),
            None => wiring.env_from_secrets.push(secret_name),
        }
    }
    Ok(wiring)
}

/// Upsert the consumer-side copy. The `(sameNamespace) -> ownerAction` rule
/// is [`mirror_owner_action`].
async fn mirror(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    provider_ns: &str,
    secret_name: &str,
    provider: &Json,
) -> Result<()> {
    let owner_action = mirror_owner_action(provider_ns == ctx.ns);
    let data = provider.get("data").cloned().unwrap_or(Json::Null);

    match client.get(&kinds::secret(), ctx.ns, secret_name).await? {
        None => {
            let mut doc = json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "type": "Opaque",
                "metadata": {
                    "name": secret_name,
                    "namespace": ctx.ns,
                    "labels": resources::labels(ctx),
                    "annotations": { CONSUMED_BY: ctx.name },
                },
                "data": data,
            });
            if owner_action == MirrorOwner::OwnByConsumer {
                set_component_owner(&mut doc, ctx.name, ctx.uid);
            }
            client.create(&kinds::secret(), ctx.ns, &doc).await?;
            debug!(secret = %secret_name, from = %provider_ns, "binding secret mirrored");
        }
        Some(mut live) => {
            let mut changed = merge_list_annotation(&mut live, CONSUMED_BY, ctx.name);
            if live.get("data") != Some(&data) {
                live["data"] = data;
                changed = true;
            }
            if owner_action == MirrorOwner::OwnByConsumer {
                changed |= set_component_owner(&mut live, ctx.name, ctx.uid);
            }
            if changed {
                client.update(&kinds::secret(), ctx.ns, &live).await?;
            }
        }
    }
    Ok(())
}

/// Build the dependency error for a missing provider secret, deleting the
/// orphaned local copy if one is left behind. A failed cleanup augments the
/// message; the classification stays the same either way.
async fn missing_provider(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    provider_ns: &str,
    secret_name: &str,
) -> Error {
    let mut message = format!("binding secret {provider_ns}/{secret_name}");
    if provider_ns != ctx.ns {
        let orphan = match client.get(&kinds::secret(), ctx.ns, secret_name).await {
            Ok(doc) => doc.filter(|d| is_owned_by_component(d, ctx.name, ctx.uid)),
            Err(_) => None,
        };
        if orphan.is_some() {
            match client.delete(&kinds::secret(), ctx.ns, secret_name).await {
                Ok(()) => message.push_str(" (orphaned local copy deleted)"),
                Err(e) => message.push_str(&format!(" (orphaned local copy not deleted: {e})")),
            }
        }
    }
    Error::MissingDependency(message)
}

// ---- bindings ----

/// Resolve at most one binding secret through the three mutually exclusive
/// sub-modes: embedded document, external reference, auto-detection.
async fn resolve_bindings(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    caps: &mut Capabilities,
) -> Result<Vec<String>> {
    let bindings = ctx.comp.spec.bindings.as_ref();
    let binding_name = names::binding_resource(ctx.name);

    if let Some(embedded) = bindings.and_then(|b| b.embedded.as_ref()) {
        let secret = embedded_binding(ctx, client, caps, &binding_name, embedded).await?;
        return Ok(vec![secret]);
    }

    // Mode switched away from embedded: drop the resource this component
    // created before resolving anything else.
    for kind_key in &ctx.config.binding_kinds {
        let gvk = parse_gvk_key(kind_key)?;
        if !caps.supports(client, &gvk).await? {
            continue;
        }
        if let Some(doc) = client.get(&gvk, ctx.ns, &binding_name).await? {
            if is_owned_by_component(&doc, ctx.name, ctx.uid) {
                delete_if_present(client, &gvk, ctx.ns, &binding_name).await?;
            }
        }
    }

    if let Some(reference) = bindings.and_then(|b| b.resource_ref.as_deref()) {
        client
            .get(&kinds::secret(), ctx.ns, reference)
            .await?
            .ok_or_else(|| {
                Error::MissingDependency(format!("referenced binding secret {}/{reference}", ctx.ns))
            })?;
        return Ok(vec![reference.to_string()]);
    }

    let auto_detect = bindings.and_then(|b| b.auto_detect).unwrap_or(true);
    if !auto_detect {
        return Ok(Vec::new());
    }
    for kind_key in &ctx.config.binding_kinds {
        let gvk = parse_gvk_key(kind_key)?;
        if !caps.supports(client, &gvk).await? {
            continue;
        }
        if client.get(&gvk, ctx.ns, &binding_name).await?.is_none() {
            continue;
        }
        client
            .get(&kinds::secret(), ctx.ns, &binding_name)
            .await?
            .ok_or_else(|| {
                Error::MissingDependency(format!(
                    "secret {}/{binding_name} for detected {kind_key} binding",
                    ctx.ns
                ))
            })?;
        debug!(kind = %kind_key, name = %binding_name, "binding auto-detected");
        return Ok(vec![binding_name]);
    }
    // Detecting nothing is not a failure; the component simply has no binding.
    Ok(Vec::new())
}

/// Upsert the inline binding document and require its secret to exist.
async fn embedded_binding(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    caps: &mut Capabilities,
    binding_name: &str,
    embedded: &Json,
) -> Result<String> {
    let body = embedded
        .as_object()
        .ok_or_else(|| Error::Invalid("embedded binding must be an object".into()))?;
    if body.contains_key("metadata") {
        return Err(Error::Invalid(
            "embedded binding must not carry a metadata section".into(),
        ));
    }
    if !body.contains_key("spec") {
        return Err(Error::Invalid(
            "embedded binding requires a spec section".into(),
        ));
    }

    let mut desired = embedded.clone();
    let default_kind = ctx
        .config
        .binding_kinds
        .first()
        .map(String::as_str)
        .unwrap_or_default();
    let default_gvk = parse_gvk_key(default_kind)?;
    if desired.get("apiVersion").is_none() {
        let api_version = if default_gvk.group.is_empty() {
            default_gvk.version.clone()
        } else {
            format!("{}/{}", default_gvk.group, default_gvk.version)
        };
        desired["apiVersion"] = json!(api_version);
    }
    if desired.get("kind").is_none() {
        desired["kind"] = json!(default_gvk.kind);
    }

    let api_version = desired["apiVersion"].as_str().unwrap_or_default();
    let kind = desired["kind"].as_str().unwrap_or_default();
    if kind.is_empty() || api_version.is_empty() {
        return Err(Error::Invalid(
            "embedded binding needs an apiVersion and kind".into(),
        ));
    }
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    if !caps.supports(client, &gvk).await? {
        return Err(Error::MissingDependency(format!(
            "binding kind {} is not installed",
            gvk_key(&gvk)
        )));
    }

    let mut metadata = json!({
        "name": binding_name,
        "namespace": ctx.ns,
        "ownerReferences": [component_owner_reference(ctx.name, ctx.uid)],
    });
    // The binding inherits the owner's labels and annotations.
    if let Some(labels) = &ctx.comp.metadata.labels {
        metadata["labels"] = json!(labels);
    }
    if let Some(annotations) = &ctx.comp.metadata.annotations {
        metadata["annotations"] = json!(annotations);
    }
    desired["metadata"] = metadata;
    upsert(client, &gvk, ctx.ns, &desired).await?;

    client
        .get(&kinds::secret(), ctx.ns, binding_name)
        .await?
        .ok_or_else(|| {
            Error::MissingDependency(format!(
                "secret {}/{binding_name} for embedded binding",
                ctx.ns
            ))
        })?;
    Ok(binding_name.to_string())
}

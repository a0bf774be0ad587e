//! Certificate dependency resolution against cert-manager.
//!
//! Two independent slots, one for the service-facing certificate and one for
//! the route-facing one. Each slot either resolves to the TLS secret its
//! downstream resources may reference, or blocks the pass until cert-manager
//! reports the certificate ready. There is no explicit requeue on a blocked
//! pass: the watch on the Certificate resource wakes the orchestrator.

use serde_json::{json, Value as Json};
use tracing::debug;

use coral_apply::{delete_if_present, upsert};
use coral_core::{Error, Result};
use coral_kubehub::{kinds, Capabilities, DocumentClient};
use coral_model::CertificateRequest;

use crate::names;
use crate::resources;
use crate::PassCtx;

const DEFAULT_DURATION: &str = "8760h";
const DEFAULT_RENEW_BEFORE: &str = "744h";

/// TLS secret names the rest of the pass may reference, one per slot. `None`
/// means the slot requested nothing (and referenced nothing).
#[derive(Debug, Default, Clone)]
pub struct TlsSecrets {
    pub service: Option<String>,
    pub route: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Service,
    Route,
}

impl Slot {
    fn certificate_name(&self, component: &str) -> String {
        match self {
            Slot::Service => names::svc_certificate(component),
            Slot::Route => names::route_certificate(component),
        }
    }

    fn secret_name(&self, component: &str) -> String {
        match self {
            Slot::Service => names::svc_tls_secret(component),
            Slot::Route => names::route_tls_secret(component),
        }
    }
}

/// Resolve both certificate slots. Returns only when each slot is ready or
/// not requested; a pending certificate surfaces as
/// [`Error::CertificateNotReady`].
pub async fn reconcile(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    caps: &mut Capabilities,
) -> Result<TlsSecrets> {
    let spec = &ctx.comp.spec;
    let supported = caps.supports(client, &kinds::certificate()).await?;

    let service = resolve_slot(
        ctx,
        client,
        supported,
        Slot::Service,
        spec.service.as_ref().and_then(|s| s.certificate.as_ref()),
        spec.service
            .as_ref()
            .and_then(|s| s.certificate_secret_ref.as_deref()),
    )
    .await?;
    let route = resolve_slot(
        ctx,
        client,
        supported,
        Slot::Route,
        spec.route.as_ref().and_then(|r| r.certificate.as_ref()),
        spec.route
            .as_ref()
            .and_then(|r| r.certificate_secret_ref.as_deref()),
    )
    .await?;

    Ok(TlsSecrets { service, route })
}

async fn resolve_slot(
    ctx: &PassCtx<'_>,
    client: &dyn DocumentClient,
    supported: bool,
    slot: Slot,
    request: Option<&CertificateRequest>,
    secret_ref: Option<&str>,
) -> Result<Option<String>> {
    let cert_name = slot.certificate_name(ctx.name);

    let Some(request) = request else {
        // Nothing requested for this slot; a certificate from an earlier
        // spec revision must not linger.
        if supported {
            delete_if_present(client, &kinds::certificate(), ctx.ns, &cert_name).await?;
        }
        return Ok(secret_ref.map(str::to_string));
    };

    if !supported {
        debug!(certificate = %cert_name, "cert-manager not installed, skipping slot");
        return Ok(secret_ref.map(str::to_string));
    }

    let secret_name = slot.secret_name(ctx.name);
    let desired = certificate_doc(ctx, slot, &cert_name, &secret_name, request);
    upsert(client, &kinds::certificate(), ctx.ns, &desired).await?;

    let live = client
        .get(&kinds::certificate(), ctx.ns, &cert_name)
        .await?
        .ok_or_else(|| Error::MissingDependency(format!("certificate {}/{cert_name}", ctx.ns)))?;
    if !is_ready(&live) {
        return Err(Error::CertificateNotReady(cert_name));
    }
    Ok(Some(secret_name))
}

fn certificate_doc(
    ctx: &PassCtx<'_>,
    slot: Slot,
    cert_name: &str,
    secret_name: &str,
    request: &CertificateRequest,
) -> Json {
    let common_name = match slot {
        Slot::Service => format!("{}.{}.svc", ctx.name, ctx.ns),
        Slot::Route => route_common_name(ctx),
    };
    let (issuer_name, issuer_kind) = match &request.issuer_ref {
        Some(r) => (
            r.name.clone(),
            r.kind.clone().unwrap_or_else(|| "Issuer".to_string()),
        ),
        None => (
            ctx.config.default_issuer.clone(),
            if ctx.config.use_cluster_issuer {
                "ClusterIssuer".to_string()
            } else {
                "Issuer".to_string()
            },
        ),
    };

    let mut doc = json!({
        "apiVersion": "cert-manager.io/v1",
        "kind": "Certificate",
        "metadata": {
            "name": cert_name,
            "namespace": ctx.ns,
            "labels": resources::labels(ctx),
            "ownerReferences": [coral_apply::component_owner_reference(ctx.name, ctx.uid)],
        },
        "spec": {
            "secretName": secret_name,
            "commonName": common_name,
            "dnsNames": [common_name],
            "duration": request.duration.clone().unwrap_or_else(|| DEFAULT_DURATION.into()),
            "renewBefore": request.renew_before.clone().unwrap_or_else(|| DEFAULT_RENEW_BEFORE.into()),
            "issuerRef": { "name": issuer_name, "kind": issuer_kind },
        },
    });
    if let Some(orgs) = &request.organization {
        doc["spec"]["subject"] = json!({ "organizations": orgs });
    }
    doc
}

/// Synthesized route host: the explicit host, else
/// `<name>-<namespace>.<defaultHostname>` when a default is configured.
pub fn route_common_name(ctx: &PassCtx<'_>) -> String {
    if let Some(host) = ctx
        .comp
        .spec
        .route
        .as_ref()
        .and_then(|r| r.host.as_deref())
    {
        return host.to_string();
    }
    match &ctx.config.default_hostname {
        Some(suffix) => format!("{}-{}.{}", ctx.name, ctx.ns, suffix),
        None => format!("{}-{}", ctx.name, ctx.ns),
    }
}

fn is_ready(certificate: &Json) -> bool {
    certificate
        .pointer("/status/conditions")
        .and_then(Json::as_array)
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(Json::as_str) == Some("Ready")
                    && c.get("status").and_then(Json::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_a_true_ready_condition() {
        assert!(!is_ready(&json!({})));
        assert!(!is_ready(&json!({"status": {"conditions": []}})));
        assert!(!is_ready(&json!({"status": {"conditions": [
            {"type": "Ready", "status": "False", "reason": "Pending"},
        ]}})));
        assert!(is_ready(&json!({"status": {"conditions": [
            {"type": "Issuing", "status": "True"},
            {"type": "Ready", "status": "True"},
        ]}})));
    }

    #[test]
    fn slot_names_are_deterministic() {
        assert_eq!(Slot::Service.certificate_name("web"), "web-svc-crt");
        assert_eq!(Slot::Service.secret_name("web"), "web-svc-tls");
        assert_eq!(Slot::Route.certificate_name("web"), "web-route-crt");
        assert_eq!(Slot::Route.secret_name("web"), "web-route-tls");
    }
}

//! Coral reconciliation core.
//!
//! [`Reconciler::reconcile`] drives one request through the fixed stage
//! order: fetch, validate, capability refresh, certificates, bindings, plan,
//! apply, status. Every stage returns a classified [`coral_core::Error`];
//! only this orchestrator turns errors into requeue decisions, via the
//! condition ledger. Resolvers and builders live in the submodules and are
//! pure or near-pure over the [`PassCtx`].

#![forbid(unsafe_code)]

pub mod affinity;
pub mod bindings;
pub mod certs;
pub mod names;
pub mod resources;
pub mod shape;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use coral_apply::{delete_if_present, is_owned_by_component, upsert};
use coral_core::conditions::{retry_delay, set_condition};
use coral_core::config::CONFIG_MAP_NAME;
use coral_core::{Error, OperatorConfig, Outcome, Result};
use coral_kubehub::{kinds, Capabilities, DocumentClient};
use coral_model::{Component, ComponentSpec, ComponentStatus, ConditionStatus, ConditionType};

use shape::Shape;

/// Immutable view of the component a single pass works on, plus the per-pass
/// operator configuration. Everything downstream of fetch borrows this.
pub struct PassCtx<'a> {
    pub comp: &'a Component,
    pub name: &'a str,
    pub ns: &'a str,
    pub uid: &'a str,
    pub config: &'a OperatorConfig,
}

pub struct Reconciler {
    client: Arc<dyn DocumentClient>,
    operator_ns: String,
}

impl Reconciler {
    pub fn new(client: Arc<dyn DocumentClient>, operator_ns: impl Into<String>) -> Self {
        Self {
            client,
            operator_ns: operator_ns.into(),
        }
    }

    /// Converge one component. Never returns `Err` for anything a pass can
    /// classify; the error branch only carries failures to fetch the
    /// instance itself, which the dispatch layer retries.
    pub async fn reconcile(&self, ns: &str, name: &str) -> Result<Outcome> {
        let started = std::time::Instant::now();
        metrics::counter!("reconcile_passes", 1u64);
        let outcome = self.run(ns, name, Utc::now()).await;
        metrics::histogram!("reconcile_duration_seconds", started.elapsed().as_secs_f64());
        outcome
    }

    async fn run(&self, ns: &str, name: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let Some(doc) = self.client.get(&kinds::component(), ns, name).await? else {
            // Deleted; owner references take the children with it.
            debug!(ns, name, "component gone");
            return Ok(Outcome::Done);
        };

        // A just-created instance is reconciled by the update its own
        // defaulting triggers; applying children now would race it.
        if doc.pointer("/metadata/generation").and_then(Json::as_i64) == Some(1) {
            debug!(ns, name, "first generation, deferring to the defaulting update");
            return Ok(Outcome::Done);
        }

        let uid = doc
            .pointer("/metadata/uid")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let mut status: ComponentStatus = doc
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default();
        // The ledger needs the pre-failure condition to size the backoff.
        let previous = status.condition(ConditionType::Reconciled).cloned();

        match self.run_pass(ns, name, &uid, &doc, &mut status, now).await {
            Ok(()) => {
                set_condition(
                    &mut status,
                    ConditionType::Reconciled,
                    ConditionStatus::True,
                    None,
                    None,
                    now,
                );
                info!(ns, name, "reconciled");
                match self.persist_status(ns, &doc, &status).await {
                    Ok(()) => Ok(Outcome::Done),
                    Err(e) if e.is_conflict() => Ok(Outcome::Requeue(Duration::ZERO)),
                    Err(e) => {
                        warn!(ns, name, error = %e, "status write failed after a clean pass");
                        Ok(Outcome::Requeue(Duration::from_secs(1)))
                    }
                }
            }
            Err(err) => {
                metrics::counter!("reconcile_failures", 1u64);
                warn!(ns, name, error = %err, reason = err.reason(), "reconcile failed");
                if matches!(err, Error::MissingDependency(_) | Error::CertificateNotReady(_)) {
                    set_condition(
                        &mut status,
                        ConditionType::DependenciesSatisfied,
                        ConditionStatus::False,
                        Some(err.reason().to_string()),
                        Some(err.to_string()),
                        now,
                    );
                }
                set_condition(
                    &mut status,
                    ConditionType::Reconciled,
                    ConditionStatus::False,
                    Some(err.reason().to_string()),
                    Some(err.to_string()),
                    now,
                );
                self.emit_warning(ns, name, &uid, &err, now).await;

                let outcome = if err.is_terminal() || err.is_blocking() {
                    Outcome::Done
                } else if err.is_conflict() {
                    Outcome::Requeue(Duration::ZERO)
                } else {
                    Outcome::Requeue(retry_delay(previous.as_ref(), now))
                };
                match self.persist_status(ns, &doc, &status).await {
                    Ok(()) => Ok(outcome),
                    Err(e) if e.is_conflict() => Ok(Outcome::Requeue(Duration::ZERO)),
                    Err(e) => {
                        warn!(ns, name, error = %e, "status write failed");
                        Ok(Outcome::Requeue(Duration::from_secs(1)))
                    }
                }
            }
        }
    }

    async fn run_pass(
        &self,
        ns: &str,
        name: &str,
        uid: &str,
        doc: &Json,
        status: &mut ComponentStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let comp: Component = serde_json::from_value(doc.clone())
            .map_err(|e| Error::Invalid(format!("unparseable component: {e}")))?;
        validate(&comp.spec)?;

        let config = self.load_config().await?;
        let ctx = PassCtx {
            comp: &comp,
            name,
            ns,
            uid,
            config: &config,
        };
        let client = self.client.as_ref();
        let mut caps = Capabilities::new();

        let tls = certs::reconcile(&ctx, client, &mut caps).await?;
        let wiring = bindings::reconcile(&ctx, client, &mut caps, status).await?;
        set_condition(
            status,
            ConditionType::DependenciesSatisfied,
            ConditionStatus::True,
            None,
            None,
            now,
        );

        self.apply(&ctx, &mut caps, &tls, &wiring, status).await
    }

    /// Plan and apply the child-resource set for the effective shape.
    async fn apply(
        &self,
        ctx: &PassCtx<'_>,
        caps: &mut Capabilities,
        tls: &certs::TlsSecrets,
        wiring: &bindings::BindingWiring,
        status: &mut ComponentStatus,
    ) -> Result<()> {
        let client = self.client.as_ref();
        let spec = &ctx.comp.spec;

        let image = self.resolve_image(ctx, caps).await?;
        if status.image_reference.as_deref() != Some(image.as_str()) {
            status.image_reference = Some(image.clone());
        }

        let serverless_supported = caps.supports(client, &kinds::serverless_service()).await?;
        let shape = shape::decide(spec.is_serverless(), serverless_supported, spec.has_storage())?;
        debug!(ns = ctx.ns, name = ctx.name, ?shape, "shape decided");

        // The pod template references the account by name, so it goes first.
        if spec.service_account_name.is_none() {
            upsert(
                client,
                &kinds::service_account(),
                ctx.ns,
                &resources::service_account(ctx),
            )
            .await?;
        } else if let Some(sa) = client
            .get(&kinds::service_account(), ctx.ns, ctx.name)
            .await?
        {
            if is_owned_by_component(&sa, ctx.name, ctx.uid) {
                delete_if_present(client, &kinds::service_account(), ctx.ns, ctx.name).await?;
            }
        }

        let monitor_supported = caps.supports(client, &kinds::service_monitor()).await?;
        let monitoring =
            spec.monitoring.is_some() && monitor_supported && shape != Shape::Serverless;

        if shape == Shape::Serverless {
            delete_if_present(client, &kinds::service(), ctx.ns, ctx.name).await?;
        } else {
            upsert(
                client,
                &kinds::service(),
                ctx.ns,
                &resources::service(ctx, monitoring),
            )
            .await?;
        }

        let affinity = affinity::compose(spec.affinity.as_ref(), spec.effective_architecture());
        let wiring = resources::Wiring {
            image: &image,
            env_from_secrets: &wiring.env_from_secrets,
            mounted_secrets: &wiring.mounted_secrets,
            tls_secret: tls.service.as_deref(),
            affinity: affinity.as_ref(),
        };
        let workload = match shape {
            Shape::Stateless => resources::deployment(ctx, &wiring),
            Shape::Stateful => resources::stateful_set(ctx, &wiring),
            Shape::Serverless => resources::serverless_workload(ctx, &wiring),
        };
        upsert(client, &shape.workload_gvk(), ctx.ns, &workload).await?;
        for gvk in shape.inactive_gvks() {
            if gvk.group == kinds::serverless_service().group && !serverless_supported {
                // The kind is not served; there is nothing to address.
                continue;
            }
            delete_if_present(client, &gvk, ctx.ns, ctx.name).await?;
        }

        if shape == Shape::Stateful {
            upsert(
                client,
                &kinds::service(),
                ctx.ns,
                &resources::headless_service(ctx),
            )
            .await?;
        } else {
            delete_if_present(
                client,
                &kinds::service(),
                ctx.ns,
                &names::headless_service(ctx.name),
            )
            .await?;
        }

        if spec.autoscaling.is_some() && shape != Shape::Serverless {
            upsert(
                client,
                &kinds::autoscaler(),
                ctx.ns,
                &resources::autoscaler(ctx, shape),
            )
            .await?;
        } else {
            delete_if_present(client, &kinds::autoscaler(), ctx.ns, ctx.name).await?;
        }

        self.apply_exposure(ctx, caps, shape, tls).await?;

        if monitoring {
            upsert(
                client,
                &kinds::service_monitor(),
                ctx.ns,
                &resources::service_monitor(ctx),
            )
            .await?;
        } else if monitor_supported {
            delete_if_present(client, &kinds::service_monitor(), ctx.ns, ctx.name).await?;
        }

        Ok(())
    }

    /// Route preferred over Ingress when both are installed; whichever kind
    /// lost (or exposure as a whole) is deleted.
    async fn apply_exposure(
        &self,
        ctx: &PassCtx<'_>,
        caps: &mut Capabilities,
        shape: Shape,
        tls: &certs::TlsSecrets,
    ) -> Result<()> {
        let client = self.client.as_ref();
        let route_supported = caps.supports(client, &kinds::route()).await?;
        let ingress_supported = caps.supports(client, &kinds::ingress()).await?;
        let exposed = ctx.comp.spec.is_exposed() && shape != Shape::Serverless;

        let host = exposed.then(|| certs::route_common_name(ctx));
        if exposed && route_supported {
            let tls_block = self.route_tls(ctx, tls.route.as_deref()).await?;
            upsert(
                client,
                &kinds::route(),
                ctx.ns,
                &resources::route(ctx, host.as_deref(), tls_block),
            )
            .await?;
            if ingress_supported {
                delete_if_present(client, &kinds::ingress(), ctx.ns, ctx.name).await?;
            }
        } else if exposed && ingress_supported {
            upsert(
                client,
                &kinds::ingress(),
                ctx.ns,
                &resources::ingress(ctx, host.as_deref(), tls.route.as_deref()),
            )
            .await?;
        } else {
            if route_supported {
                delete_if_present(client, &kinds::route(), ctx.ns, ctx.name).await?;
            }
            if ingress_supported {
                delete_if_present(client, &kinds::ingress(), ctx.ns, ctx.name).await?;
            }
        }
        Ok(())
    }

    /// Route TLS block: termination and policy from the route descriptor,
    /// PEM material inlined from the resolved TLS secret when one exists.
    async fn route_tls(&self, ctx: &PassCtx<'_>, tls_secret: Option<&str>) -> Result<Option<Json>> {
        let route = ctx.comp.spec.route.as_ref();
        let termination = route.and_then(|r| r.termination.as_deref());
        let policy = route.and_then(|r| r.insecure_edge_termination_policy.as_deref());

        let Some(secret_name) = tls_secret else {
            let Some(termination) = termination else {
                return Ok(None);
            };
            let mut block = serde_json::json!({ "termination": termination });
            if let Some(policy) = policy {
                block["insecureEdgeTerminationPolicy"] = serde_json::json!(policy);
            }
            return Ok(Some(block));
        };

        let secret = self
            .client
            .get(&kinds::secret(), ctx.ns, secret_name)
            .await?
            .ok_or_else(|| {
                Error::MissingDependency(format!("route TLS secret {}/{secret_name}", ctx.ns))
            })?;
        let mut block = serde_json::json!({ "termination": termination.unwrap_or("edge") });
        if let Some(policy) = policy {
            block["insecureEdgeTerminationPolicy"] = serde_json::json!(policy);
        }
        for (data_key, tls_key) in [
            ("tls.crt", "certificate"),
            ("tls.key", "key"),
            ("ca.crt", "caCertificate"),
        ] {
            if let Some(value) = secret.pointer(&format!("/data/{data_key}")).and_then(Json::as_str)
            {
                block[tls_key] = serde_json::json!(decode_pem(value, secret_name, data_key)?);
            }
        }
        Ok(Some(block))
    }

    /// Refine the declared image through an image-stream lookup when the
    /// platform has one; failures fall back to the declared image.
    async fn resolve_image(&self, ctx: &PassCtx<'_>, caps: &mut Capabilities) -> Result<String> {
        let declared = ctx.comp.spec.application_image.clone();
        if !looks_like_stream_tag(&declared) {
            return Ok(declared);
        }
        if !caps
            .supports(self.client.as_ref(), &kinds::image_stream_tag())
            .await?
        {
            return Ok(declared);
        }
        match self
            .client
            .get(&kinds::image_stream_tag(), ctx.ns, &declared)
            .await
        {
            Ok(Some(tag)) => Ok(tag
                .pointer("/image/dockerImageReference")
                .and_then(Json::as_str)
                .map(str::to_string)
                .unwrap_or(declared)),
            Ok(None) => Ok(declared),
            Err(e) => {
                warn!(image = %declared, error = %e, "image-stream lookup failed, using declared image");
                Ok(declared)
            }
        }
    }

    async fn load_config(&self) -> Result<OperatorConfig> {
        let Some(cm) = self
            .client
            .get(&kinds::config_map(), &self.operator_ns, CONFIG_MAP_NAME)
            .await?
        else {
            return Ok(OperatorConfig::default());
        };
        let data: BTreeMap<String, String> = cm
            .get("data")
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default();
        Ok(OperatorConfig::from_map(&data))
    }

    /// One conditional status write per pass. A status differing only in
    /// `lastUpdateTime` churn is not persisted, so a converged pass stays a
    /// write-free fixed point.
    async fn persist_status(&self, ns: &str, doc: &Json, status: &ComponentStatus) -> Result<()> {
        let prior: ComponentStatus = doc
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default();
        if significant(&prior) == significant(status) {
            return Ok(());
        }
        let mut out = doc.clone();
        out["status"] = serde_json::to_value(status)
            .map_err(|e| Error::Transient(anyhow::anyhow!(e).context("serializing status")))?;
        self.client
            .update_status(&kinds::component(), ns, &out)
            .await?;
        Ok(())
    }

    async fn emit_warning(&self, ns: &str, name: &str, uid: &str, err: &Error, now: DateTime<Utc>) {
        let event = resources::warning_event(name, ns, uid, err.reason(), &err.to_string(), now);
        if let Err(e) = self.client.create(&kinds::event(), ns, &event).await {
            warn!(ns, name, error = %e, "failed to record warning event");
        }
    }
}

fn decode_pem(value: &str, secret: &str, key: &str) -> Result<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| {
            Error::Transient(anyhow::anyhow!(e).context(format!("decoding {key} in secret {secret}")))
        })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::Transient(anyhow::anyhow!(e).context(format!("{key} in secret {secret} is not PEM text")))
    })
}

fn significant(status: &ComponentStatus) -> Json {
    let mut value = serde_json::to_value(status).expect("status serializes");
    if let Some(conditions) = value.get_mut("conditions").and_then(Json::as_array_mut) {
        for c in conditions {
            if let Some(obj) = c.as_object_mut() {
                obj.remove("lastUpdateTime");
            }
        }
    }
    value
}

fn looks_like_stream_tag(image: &str) -> bool {
    // "name:tag" with no registry or repository path component.
    !image.contains('/') && image.contains(':')
}

/// Structural validation; failures are terminal and never requeued.
fn validate(spec: &ComponentSpec) -> Result<()> {
    if spec.application_image.trim().is_empty() {
        return Err(Error::Invalid("applicationImage must not be empty".into()));
    }
    if let Some(replicas) = spec.replicas {
        if replicas < 0 {
            return Err(Error::Invalid(format!("replicas must be >= 0, got {replicas}")));
        }
    }
    if let Some(auto) = &spec.autoscaling {
        if auto.max_replicas < 1 {
            return Err(Error::Invalid(format!(
                "autoscaling.maxReplicas must be >= 1, got {}",
                auto.max_replicas
            )));
        }
        if let Some(min) = auto.min_replicas {
            if min > auto.max_replicas {
                return Err(Error::Invalid(format!(
                    "autoscaling.minReplicas {min} exceeds maxReplicas {}",
                    auto.max_replicas
                )));
            }
        }
    }
    if let Some(service) = &spec.service {
        for port in [service.port, service.target_port, service.node_port]
            .into_iter()
            .flatten()
        {
            if !(1..=65535).contains(&port) {
                return Err(Error::Invalid(format!("port {port} out of range")));
            }
        }
    }
    if let Some(size) = spec.storage.as_ref().and_then(|s| s.size.as_deref()) {
        validate_quantity(size)?;
    }
    Ok(())
}

/// Accepts the Kubernetes quantity grammar subset the storage field uses:
/// a positive decimal number with an optional binary/decimal suffix.
fn validate_quantity(size: &str) -> Result<()> {
    const SUFFIXES: [&str; 14] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E", "",
    ];
    let size = size.trim();
    let number = SUFFIXES
        .iter()
        .find_map(|s| size.strip_suffix(s))
        .unwrap_or(size);
    let valid = !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit() || c == '.')
        && number.chars().filter(|c| *c == '.').count() <= 1
        && number.chars().any(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::Invalid(format!("malformed storage size {size:?}")))
    }
}

//! Desired-state builders for every managed child document.
//!
//! Builders are pure: they take the pass context plus whatever the
//! resolvers already decided (image, binding wiring, TLS secrets) and
//! return the JSON document `coral_apply::upsert` converges toward.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Affinity;
use serde_json::{json, Value as Json};

use coral_apply::component_owner_reference;

use crate::names;
use crate::shape::Shape;
use crate::PassCtx;

pub const MANAGED_BY: &str = "coral-operator";
pub const MONITOR_ENABLED_LABEL: &str = "monitor.coral.dev/enabled";

/// Pod-level decisions made by the resolvers before planning.
pub struct Wiring<'a> {
    pub image: &'a str,
    /// Binding secrets injected as environment.
    pub env_from_secrets: &'a [String],
    /// Binding secrets mounted as files: (secret name, mount path).
    pub mounted_secrets: &'a [(String, String)],
    /// Service-facing TLS secret mounted into the pod.
    pub tls_secret: Option<&'a str>,
    pub affinity: Option<&'a Affinity>,
}

pub fn labels(ctx: &PassCtx<'_>) -> Json {
    json!({
        "app.kubernetes.io/name": ctx.name,
        "app.kubernetes.io/instance": ctx.name,
        "app.kubernetes.io/managed-by": MANAGED_BY,
    })
}

pub fn selector(ctx: &PassCtx<'_>) -> Json {
    json!({ "app.kubernetes.io/instance": ctx.name })
}

fn metadata(ctx: &PassCtx<'_>, name: &str) -> Json {
    json!({
        "name": name,
        "namespace": ctx.ns,
        "labels": labels(ctx),
        "ownerReferences": [component_owner_reference(ctx.name, ctx.uid)],
    })
}

fn app_container(ctx: &PassCtx<'_>, wiring: &Wiring<'_>, with_storage: bool) -> Json {
    let spec = &ctx.comp.spec;
    let mut c = json!({
        "name": "app",
        "image": wiring.image,
        "ports": [{ "containerPort": spec.service_target_port(), "name": "app" }],
    });
    if let Some(cmd) = &spec.command {
        c["command"] = json!(cmd);
    }
    if let Some(args) = &spec.args {
        c["args"] = json!(args);
    }
    if let Some(policy) = &spec.pull_policy {
        c["imagePullPolicy"] = json!(policy);
    }
    if let Some(env) = &spec.env {
        c["env"] = serde_json::to_value(env).expect("EnvVar serializes");
    }

    let mut env_from: Vec<Json> = Vec::new();
    if let Some(sources) = &spec.env_from {
        for s in sources {
            env_from.push(serde_json::to_value(s).expect("EnvFromSource serializes"));
        }
    }
    for secret in wiring.env_from_secrets {
        env_from.push(json!({ "secretRef": { "name": secret } }));
    }
    if !env_from.is_empty() {
        c["envFrom"] = Json::Array(env_from);
    }

    let mut mounts: Vec<Json> = Vec::new();
    if with_storage {
        if let Some(storage) = &spec.storage {
            mounts.push(json!({
                "name": "data",
                "mountPath": storage.mount_path.as_deref().unwrap_or("/data"),
            }));
        }
    }
    for (secret, path) in wiring.mounted_secrets {
        mounts.push(json!({ "name": secret, "mountPath": path, "readOnly": true }));
    }
    if wiring.tls_secret.is_some() {
        mounts.push(json!({ "name": "svc-certificate", "mountPath": "/etc/x509/certs", "readOnly": true }));
    }
    if !mounts.is_empty() {
        c["volumeMounts"] = Json::Array(mounts);
    }
    c
}

fn pod_spec(ctx: &PassCtx<'_>, wiring: &Wiring<'_>, with_storage: bool) -> Json {
    let spec = &ctx.comp.spec;
    let mut containers = vec![app_container(ctx, wiring, with_storage)];
    if let Some(sidecars) = &spec.sidecar_containers {
        for s in sidecars {
            containers.push(serde_json::to_value(s).expect("Container serializes"));
        }
    }
    let mut pod = json!({
        "containers": containers,
        "serviceAccountName": spec.service_account_name.clone().unwrap_or_else(|| ctx.name.to_string()),
    });
    if let Some(init) = &spec.init_containers {
        pod["initContainers"] = serde_json::to_value(init).expect("Container serializes");
    }
    if let Some(secret) = &spec.pull_secret {
        pod["imagePullSecrets"] = json!([{ "name": secret }]);
    }
    if let Some(aff) = wiring.affinity {
        pod["affinity"] = serde_json::to_value(aff).expect("Affinity serializes");
    }

    let mut volumes: Vec<Json> = Vec::new();
    for (secret, _path) in wiring.mounted_secrets {
        volumes.push(json!({ "name": secret, "secret": { "secretName": secret } }));
    }
    if let Some(tls) = wiring.tls_secret {
        volumes.push(json!({ "name": "svc-certificate", "secret": { "secretName": tls } }));
    }
    if !volumes.is_empty() {
        pod["volumes"] = Json::Array(volumes);
    }
    pod
}

fn pod_template(ctx: &PassCtx<'_>, wiring: &Wiring<'_>, with_storage: bool) -> Json {
    json!({
        "metadata": { "labels": labels(ctx) },
        "spec": pod_spec(ctx, wiring, with_storage),
    })
}

pub fn deployment(ctx: &PassCtx<'_>, wiring: &Wiring<'_>) -> Json {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(ctx, ctx.name),
        "spec": {
            "replicas": ctx.comp.spec.replicas.unwrap_or(1),
            "selector": { "matchLabels": selector(ctx) },
            "template": pod_template(ctx, wiring, false),
        },
    })
}

pub fn stateful_set(ctx: &PassCtx<'_>, wiring: &Wiring<'_>) -> Json {
    let spec = &ctx.comp.spec;
    let claim = spec
        .storage
        .as_ref()
        .map(|storage| match &storage.volume_claim_template {
            // A full template wins over the size shorthand.
            Some(t) => t.clone(),
            None => json!({
                "metadata": { "name": "data" },
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": { "requests": { "storage": storage.size.clone().unwrap_or_else(|| "1Gi".into()) } },
                },
            }),
        });
    let mut doc = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": metadata(ctx, ctx.name),
        "spec": {
            "replicas": spec.replicas.unwrap_or(1),
            "serviceName": names::headless_service(ctx.name),
            "selector": { "matchLabels": selector(ctx) },
            "template": pod_template(ctx, wiring, true),
        },
    });
    if let Some(claim) = claim {
        doc["spec"]["volumeClaimTemplates"] = json!([claim]);
    }
    doc
}

/// Knative serving document: one user container, scaling left entirely to
/// the platform.
pub fn serverless_workload(ctx: &PassCtx<'_>, wiring: &Wiring<'_>) -> Json {
    json!({
        "apiVersion": "serving.knative.dev/v1",
        "kind": "Service",
        "metadata": metadata(ctx, ctx.name),
        "spec": {
            "template": {
                "metadata": { "labels": labels(ctx) },
                "spec": {
                    "containers": [app_container(ctx, wiring, false)],
                    "serviceAccountName": ctx.comp.spec.service_account_name.clone()
                        .unwrap_or_else(|| ctx.name.to_string()),
                },
            },
        },
    })
}

pub fn service(ctx: &PassCtx<'_>, monitor_enabled: bool) -> Json {
    let spec = &ctx.comp.spec;
    let svc = spec.service.as_ref();

    let mut ports = vec![json!({
        "name": "app",
        "port": spec.service_port(),
        "targetPort": spec.service_target_port(),
    })];
    if let Some(extra) = svc.and_then(|s| s.ports.as_ref()) {
        for p in extra {
            ports.push(serde_json::to_value(p).expect("ServicePort serializes"));
        }
    }
    if let Some(node_port) = svc.and_then(|s| s.node_port) {
        ports[0]["nodePort"] = json!(node_port);
    }

    let mut meta = metadata(ctx, ctx.name);
    if monitor_enabled {
        meta["labels"][MONITOR_ENABLED_LABEL] = json!("true");
    }
    if let Some(annotations) = svc.and_then(|s| s.annotations.as_ref()) {
        meta["annotations"] = json!(annotations);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": meta,
        "spec": {
            "type": svc.and_then(|s| s.type_.clone()).unwrap_or_else(|| "ClusterIP".into()),
            "selector": selector(ctx),
            "ports": ports,
        },
    })
}

/// Governing service for the stateful shape; no cluster IP.
pub fn headless_service(ctx: &PassCtx<'_>) -> Json {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(ctx, &names::headless_service(ctx.name)),
        "spec": {
            "type": "ClusterIP",
            "clusterIP": "None",
            "selector": selector(ctx),
            "ports": [{ "name": "app", "port": ctx.comp.spec.service_port() }],
        },
    })
}

pub fn autoscaler(ctx: &PassCtx<'_>, shape: Shape) -> Json {
    let auto = ctx
        .comp
        .spec
        .autoscaling
        .as_ref()
        .expect("autoscaler built only when autoscaling is configured");
    let target_kind = shape
        .scale_target_kind()
        .expect("autoscaler built only for replica-set shapes");
    let mut doc = json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": metadata(ctx, ctx.name),
        "spec": {
            "scaleTargetRef": { "apiVersion": "apps/v1", "kind": target_kind, "name": ctx.name },
            "maxReplicas": auto.max_replicas,
        },
    });
    if let Some(min) = auto.min_replicas {
        doc["spec"]["minReplicas"] = json!(min);
    }
    if let Some(cpu) = auto.target_cpu_utilization_percentage {
        doc["spec"]["metrics"] = json!([{
            "type": "Resource",
            "resource": { "name": "cpu", "target": { "type": "Utilization", "averageUtilization": cpu } },
        }]);
    }
    doc
}

pub fn route(ctx: &PassCtx<'_>, host: Option<&str>, tls: Option<Json>) -> Json {
    let r = ctx.comp.spec.route.as_ref();
    let mut meta = metadata(ctx, ctx.name);
    if let Some(annotations) = r.and_then(|r| r.annotations.as_ref()) {
        meta["annotations"] = json!(annotations);
    }
    let mut doc = json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": meta,
        "spec": {
            "to": { "kind": "Service", "name": ctx.name, "weight": 100 },
            "port": { "targetPort": "app" },
        },
    });
    if let Some(host) = host {
        doc["spec"]["host"] = json!(host);
    }
    if let Some(path) = r.and_then(|r| r.path.as_deref()) {
        doc["spec"]["path"] = json!(path);
    }
    if let Some(tls) = tls {
        doc["spec"]["tls"] = tls;
    }
    doc
}

pub fn ingress(ctx: &PassCtx<'_>, host: Option<&str>, tls_secret: Option<&str>) -> Json {
    let r = ctx.comp.spec.route.as_ref();
    let path = r.and_then(|r| r.path.as_deref()).unwrap_or("/");
    let mut rule = json!({
        "http": {
            "paths": [{
                "path": path,
                "pathType": "Prefix",
                "backend": { "service": { "name": ctx.name, "port": { "number": ctx.comp.spec.service_port() } } },
            }],
        },
    });
    if let Some(host) = host {
        rule["host"] = json!(host);
    }
    let mut doc = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": metadata(ctx, ctx.name),
        "spec": { "rules": [rule] },
    });
    if let Some(secret) = tls_secret {
        let mut tls = json!({ "secretName": secret });
        if let Some(host) = host {
            tls["hosts"] = json!([host]);
        }
        doc["spec"]["tls"] = json!([tls]);
    }
    doc
}

pub fn service_monitor(ctx: &PassCtx<'_>) -> Json {
    let monitoring = ctx
        .comp
        .spec
        .monitoring
        .as_ref()
        .expect("monitor built only when monitoring is configured");
    let mut meta = metadata(ctx, ctx.name);
    if let Some(extra) = &monitoring.labels {
        for (k, v) in extra {
            meta["labels"][k] = json!(v);
        }
    }
    let mut endpoint = json!({ "port": "app" });
    if let Some(ep) = &monitoring.endpoint {
        if let Some(interval) = &ep.interval {
            endpoint["interval"] = json!(interval);
        }
        if let Some(scheme) = &ep.scheme {
            endpoint["scheme"] = json!(scheme);
        }
        if let Some(path) = &ep.path {
            endpoint["path"] = json!(path);
        }
    }
    json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": meta,
        "spec": {
            "selector": { "matchLabels": {
                "app.kubernetes.io/instance": ctx.name,
                MONITOR_ENABLED_LABEL: "true",
            } },
            "endpoints": [endpoint],
        },
    })
}

pub fn service_account(ctx: &PassCtx<'_>) -> Json {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": metadata(ctx, ctx.name),
    })
}

/// Warning event attached to the component; names are timestamped so
/// repeated failures stay individually visible.
pub fn warning_event(
    name: &str,
    ns: &str,
    uid: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Json {
    let ts = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {
            "name": format!("{}.{:x}", name, now.timestamp_nanos_opt().unwrap_or_default()),
            "namespace": ns,
        },
        "involvedObject": {
            "apiVersion": "coral.dev/v1alpha1",
            "kind": "Component",
            "name": name,
            "namespace": ns,
            "uid": uid,
        },
        "type": "Warning",
        "reason": reason,
        "message": message,
        "firstTimestamp": ts,
        "lastTimestamp": ts,
        "count": 1,
        "source": { "component": MANAGED_BY },
    })
}

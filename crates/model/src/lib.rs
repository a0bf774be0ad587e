//! Coral Component document types.
//!
//! The `Component` custom resource is the single declarative unit this
//! operator converges. Spec types lean on `k8s_openapi` wherever a field is
//! shaped like a stock Kubernetes object (containers, env sources, affinity)
//! so that users can paste familiar YAML unchanged.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, NodeAffinity, PodAffinity, PodAntiAffinity,
    SecretKeySelector, ServicePort,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod status;

pub use status::{ComponentStatus, Condition, ConditionStatus, ConditionType};

pub const DEFAULT_SERVICE_PORT: i32 = 8080;

/// The only service-binding category the produce/consume protocol handles.
pub const BINDING_CATEGORY_OPENAPI: &str = "openapi";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "coral.dev",
    version = "v1alpha1",
    kind = "Component",
    namespaced,
    status = "ComponentStatus",
    shortname = "comp"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Container image run by the single "app" container.
    pub application_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<Autoscaling>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ComponentService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ComponentStorage>,

    /// Expose the component through a Route (preferred) or Ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<ComponentRoute>,

    /// Run as a serverless workload instead of a Deployment/StatefulSet.
    /// Requires the serverless capability to be installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverless: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<ComponentBindings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<ComponentAffinity>,
    /// Shorthand architecture list; overrides `affinity.architecture` when
    /// both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<ComponentMonitoring>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_containers: Option<Vec<Container>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,

    /// Externally managed service account. When unset the operator creates
    /// one named after the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Autoscaling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization_percentage: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Additional ports beyond the primary one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<ServicePort>>,

    /// Managed service-facing certificate (cert-manager).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRequest>,
    /// Pre-existing TLS secret; mutually exclusive with `certificate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provides: Option<Provides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumes: Option<Vec<ConsumedService>>,
}

/// Declares that this component exposes a service others can bind to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Provides {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProvidesAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvidesAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedService {
    pub name: String,
    /// Provider namespace; defaults to the consumer's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Mount the binding secret at this path instead of injecting env vars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

impl ConsumedService {
    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(BINDING_CATEGORY_OPENAPI)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStorage {
    /// Requested volume size, e.g. "10Mi". Validated before planning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Full volume-claim template; wins over `size` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// TLS termination: edge, reencrypt or passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret_ref: Option<String>,
}

/// User-tunable subset of a managed certificate request. Everything not set
/// here is defaulted by the certificate resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBindings {
    /// Scan the configured binding kinds for a resource named
    /// `<name>-binding`. Defaults to true when neither `embedded` nor
    /// `resourceRef` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detect: Option<bool>,
    /// Name of an existing binding secret in the component's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<String>,
    /// Inline binding resource body. Must carry a `spec` and no `metadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAffinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity: Option<PodAntiAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Vec<String>>,
    /// Required node labels; values are comma-separated alternatives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity_labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMonitoring {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<MonitoringEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ComponentSpec {
    pub fn is_serverless(&self) -> bool {
        self.serverless.unwrap_or(false)
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn is_exposed(&self) -> bool {
        self.expose.unwrap_or(false)
    }

    pub fn service_port(&self) -> i32 {
        self.service
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVICE_PORT)
    }

    pub fn service_target_port(&self) -> i32 {
        self.service
            .as_ref()
            .and_then(|s| s.target_port)
            .unwrap_or_else(|| self.service_port())
    }

    /// Architecture list the affinity composer should honor: the top-level
    /// shorthand wins, then the affinity block's own list.
    pub fn effective_architecture(&self) -> &[String] {
        if let Some(a) = self.architecture.as_deref() {
            if !a.is_empty() {
                return a;
            }
        }
        self.affinity
            .as_ref()
            .and_then(|a| a.architecture.as_deref())
            .unwrap_or(&[])
    }

    pub fn consumes(&self) -> &[ConsumedService] {
        self.service
            .as_ref()
            .and_then(|s| s.consumes.as_deref())
            .unwrap_or(&[])
    }

    pub fn provides(&self) -> Option<&Provides> {
        self.service.as_ref().and_then(|s| s.provides.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parses_camel_case() {
        let spec: ComponentSpec = serde_json::from_value(serde_json::json!({
            "applicationImage": "quay.io/acme/web:1",
            "storage": {"size": "10Mi", "mountPath": "/data"},
            "service": {"port": 9080, "provides": {"category": "openapi", "context": "/api"}},
        }))
        .unwrap();
        assert!(spec.has_storage());
        assert_eq!(spec.service_port(), 9080);
        assert_eq!(spec.provides().unwrap().category, "openapi");
        assert_eq!(spec.storage.unwrap().mount_path.as_deref(), Some("/data"));
    }

    #[test]
    fn architecture_shorthand_wins_over_affinity_block() {
        let mut spec = ComponentSpec::default();
        spec.affinity = Some(ComponentAffinity {
            architecture: Some(vec!["s390x".into()]),
            ..Default::default()
        });
        assert_eq!(spec.effective_architecture(), ["s390x".to_string()]);
        spec.architecture = Some(vec!["amd64".into(), "arm64".into()]);
        assert_eq!(
            spec.effective_architecture(),
            ["amd64".to_string(), "arm64".to_string()]
        );
    }

    #[test]
    fn consumed_service_category_defaults_to_openapi() {
        let c = ConsumedService {
            name: "db".into(),
            ..Default::default()
        };
        assert_eq!(c.category(), BINDING_CATEGORY_OPENAPI);
    }
}

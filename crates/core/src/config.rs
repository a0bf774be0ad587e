//! Operator-wide defaults, loaded once per reconcile pass and passed by
//! value into every resolver. There is deliberately no global state here.

use std::collections::BTreeMap;

/// ConfigMap (in the operator's namespace) the defaults are read from.
pub const CONFIG_MAP_NAME: &str = "coral-operator-config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// cert-manager issuer used when a certificate request names none.
    pub default_issuer: String,
    /// Treat the default issuer as a ClusterIssuer rather than a namespaced one.
    pub use_cluster_issuer: bool,
    /// Binding resource kinds as GVK keys ("group/version/Kind"), in
    /// preference order. Drives embedded defaulting and auto-detection.
    pub binding_kinds: Vec<String>,
    /// Suffix for synthesized route hosts (`<name>-<ns>.<suffix>`).
    pub default_hostname: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_issuer: "self-signed".to_string(),
            use_cluster_issuer: false,
            binding_kinds: vec!["binding.coral.dev/v1alpha1/ServiceBinding".to_string()],
            default_hostname: None,
        }
    }
}

impl OperatorConfig {
    pub fn from_map(data: &BTreeMap<String, String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = data.get("defaultIssuer") {
            if !v.trim().is_empty() {
                cfg.default_issuer = v.trim().to_string();
            }
        }
        if let Some(v) = data.get("useClusterIssuer") {
            cfg.use_cluster_issuer = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = data.get("bindingResourceKinds") {
            let kinds: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !kinds.is_empty() {
                cfg.binding_kinds = kinds;
            }
        }
        if let Some(v) = data.get("defaultHostname") {
            let v = v.trim();
            if !v.is_empty() {
                cfg.default_hostname = Some(v.to_string());
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_yields_defaults() {
        let cfg = OperatorConfig::from_map(&BTreeMap::new());
        assert_eq!(cfg, OperatorConfig::default());
    }

    #[test]
    fn binding_kinds_parse_in_order() {
        let mut data = BTreeMap::new();
        data.insert(
            "bindingResourceKinds".to_string(),
            " binding.coral.dev/v1alpha1/ServiceBinding , servicebinding.io/v1beta1/ServiceBinding ".to_string(),
        );
        data.insert("useClusterIssuer".to_string(), "TRUE".to_string());
        data.insert("defaultHostname".to_string(), "apps.example.com".to_string());
        let cfg = OperatorConfig::from_map(&data);
        assert_eq!(cfg.binding_kinds.len(), 2);
        assert_eq!(cfg.binding_kinds[0], "binding.coral.dev/v1alpha1/ServiceBinding");
        assert!(cfg.use_cluster_issuer);
        assert_eq!(cfg.default_hostname.as_deref(), Some("apps.example.com"));
    }
}

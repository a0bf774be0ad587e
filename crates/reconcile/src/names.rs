//! Deterministic names for managed children. Every protocol addresses its
//! documents through these, which is what lets the reconciler avoid list
//! calls entirely.

pub fn headless_service(name: &str) -> String {
    format!("{name}-headless")
}

pub fn binding_resource(name: &str) -> String {
    format!("{name}-binding")
}

/// Provider-side binding secret for a component in a namespace. Consumers
/// compute the same name from the consumed service's coordinates.
pub fn provider_secret(name: &str, namespace: &str) -> String {
    format!("{name}-{namespace}")
}

pub fn svc_certificate(name: &str) -> String {
    format!("{name}-svc-crt")
}

pub fn route_certificate(name: &str) -> String {
    format!("{name}-route-crt")
}

pub fn svc_tls_secret(name: &str) -> String {
    format!("{name}-svc-tls")
}

pub fn route_tls_secret(name: &str) -> String {
    format!("{name}-route-tls")
}

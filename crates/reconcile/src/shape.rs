//! Workload shape selection: exactly one of stateless, stateful or
//! serverless represents a component, and switching shapes must delete the
//! losers in the same pass.

use kube::core::GroupVersionKind;

use coral_core::{Error, Result};
use coral_kubehub::kinds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Stateless,
    Stateful,
    Serverless,
}

/// Decision table, evaluated in order. Serverless requested without the
/// platform capability is terminal: no shape can satisfy the request.
pub fn decide(serverless_requested: bool, serverless_supported: bool, has_storage: bool) -> Result<Shape> {
    if serverless_requested {
        if !serverless_supported {
            return Err(Error::UnsupportedCapability(
                "serverless workloads (serving.knative.dev)".into(),
            ));
        }
        return Ok(Shape::Serverless);
    }
    if has_storage {
        return Ok(Shape::Stateful);
    }
    Ok(Shape::Stateless)
}

impl Shape {
    pub fn workload_gvk(&self) -> GroupVersionKind {
        match self {
            Shape::Stateless => kinds::deployment(),
            Shape::Stateful => kinds::stateful_set(),
            Shape::Serverless => kinds::serverless_service(),
        }
    }

    /// Workload kinds the other two shapes would have created.
    pub fn inactive_gvks(&self) -> [GroupVersionKind; 2] {
        match self {
            Shape::Stateless => [kinds::stateful_set(), kinds::serverless_service()],
            Shape::Stateful => [kinds::deployment(), kinds::serverless_service()],
            Shape::Serverless => [kinds::deployment(), kinds::stateful_set()],
        }
    }

    /// The autoscaler can only target the two replica-set shapes.
    pub fn scale_target_kind(&self) -> Option<&'static str> {
        match self {
            Shape::Stateless => Some("Deployment"),
            Shape::Stateful => Some("StatefulSet"),
            Shape::Serverless => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serverless_wins_when_supported() {
        assert_eq!(decide(true, true, true).unwrap(), Shape::Serverless);
        assert_eq!(decide(true, true, false).unwrap(), Shape::Serverless);
    }

    #[test]
    fn serverless_without_capability_is_terminal() {
        let err = decide(true, false, false).unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), "CapabilityUnsupported");
    }

    #[test]
    fn storage_selects_stateful_else_stateless() {
        assert_eq!(decide(false, false, true).unwrap(), Shape::Stateful);
        assert_eq!(decide(false, true, false).unwrap(), Shape::Stateless);
    }

    #[test]
    fn inactive_shapes_cover_the_other_two_kinds() {
        let key = |gvk: &GroupVersionKind| format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        for shape in [Shape::Stateless, Shape::Stateful, Shape::Serverless] {
            let inactive = shape.inactive_gvks();
            assert_eq!(inactive.len(), 2);
            assert!(inactive.iter().all(|g| key(g) != key(&shape.workload_gvk())));
        }
    }
}

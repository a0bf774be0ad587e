//! Scheduling-constraint composition: explicit affinity copied verbatim,
//! required label/arch terms, and a ranked multi-architecture preference.
//! Pure over its inputs.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PreferredSchedulingTerm,
};

use coral_model::ComponentAffinity;

pub const ARCH_LABEL: &str = "kubernetes.io/arch";

fn is_one_of(key: &str, values: Vec<String>) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(values),
    }
}

/// Compose scheduling constraints from the explicit affinity descriptor and
/// the effective architecture list.
pub fn compose(explicit: Option<&ComponentAffinity>, architecture: &[String]) -> Option<Affinity> {
    let mut node = explicit
        .and_then(|a| a.node_affinity.clone())
        .unwrap_or_default();
    let pod_affinity = explicit.and_then(|a| a.pod_affinity.clone());
    let pod_anti_affinity = explicit.and_then(|a| a.pod_anti_affinity.clone());

    let mut required: Vec<NodeSelectorRequirement> = Vec::new();
    if let Some(labels) = explicit.and_then(|a| a.node_affinity_labels.as_ref()) {
        // BTreeMap iteration gives the sorted key order determinism needs.
        for (key, values) in labels {
            let values: Vec<String> = values
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            required.push(is_one_of(key, values));
        }
    }
    if !architecture.is_empty() {
        required.push(is_one_of(ARCH_LABEL, architecture.to_vec()));
    }

    if !required.is_empty() {
        let selector = node
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(|| NodeSelector { node_selector_terms: Vec::new() });
        if selector.node_selector_terms.is_empty() {
            selector.node_selector_terms.push(NodeSelectorTerm::default());
        }
        // Terms are OR-ed by the scheduler, so the requirements go into
        // every branch to stay a hard constraint.
        for term in &mut selector.node_selector_terms {
            term.match_expressions
                .get_or_insert_with(Vec::new)
                .extend(required.iter().cloned());
        }
    }

    if !architecture.is_empty() {
        let preferred = node
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new);
        let n = architecture.len() as i32;
        for (i, arch) in architecture.iter().enumerate() {
            preferred.push(PreferredSchedulingTerm {
                weight: n - i as i32,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![is_one_of(ARCH_LABEL, vec![arch.clone()])]),
                    match_fields: None,
                },
            });
        }
    }

    let node = (node != NodeAffinity::default()).then_some(node);
    if node.is_none() && pod_affinity.is_none() && pod_anti_affinity.is_none() {
        return None;
    }
    Some(Affinity {
        node_affinity: node,
        pod_affinity,
        pod_anti_affinity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn archs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn nothing_in_nothing_out() {
        assert_eq!(compose(None, &[]), None);
        assert_eq!(compose(Some(&ComponentAffinity::default()), &[]), None);
    }

    #[test]
    fn architecture_weights_descend_from_list_length() {
        let out = compose(None, &archs(&["ppc64le", "amd64"])).unwrap();
        let node = out.node_affinity.unwrap();

        let required = node.required_during_scheduling_ignored_during_execution.unwrap();
        let exprs = required.node_selector_terms[0].match_expressions.clone().unwrap();
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].key, ARCH_LABEL);
        assert_eq!(exprs[0].operator, "In");
        assert_eq!(exprs[0].values.clone().unwrap(), vec!["ppc64le", "amd64"]);

        let preferred = node.preferred_during_scheduling_ignored_during_execution.unwrap();
        let weights: Vec<i32> = preferred.iter().map(|p| p.weight).collect();
        assert_eq!(weights, vec![2, 1]);
        assert_eq!(
            preferred[0].preference.match_expressions.clone().unwrap()[0]
                .values
                .clone()
                .unwrap(),
            vec!["ppc64le"]
        );
    }

    #[test]
    fn label_terms_come_out_in_sorted_key_order() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "a, b".to_string());
        labels.insert("disk".to_string(), "ssd".to_string());
        let aff = ComponentAffinity {
            node_affinity_labels: Some(labels),
            ..Default::default()
        };
        let out = compose(Some(&aff), &[]).unwrap();
        let exprs = out
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms[0]
            .match_expressions
            .clone()
            .unwrap();
        assert_eq!(exprs[0].key, "disk");
        assert_eq!(exprs[1].key, "zone");
        assert_eq!(exprs[1].values.clone().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn explicit_affinity_is_copied_and_extended_not_replaced() {
        let explicit_term = NodeSelectorTerm {
            match_expressions: Some(vec![is_one_of("pool", vec!["fast".into()])]),
            match_fields: None,
        };
        let aff = ComponentAffinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![explicit_term],
                }),
                preferred_during_scheduling_ignored_during_execution: None,
            }),
            ..Default::default()
        };
        let out = compose(Some(&aff), &archs(&["amd64"])).unwrap();
        let terms = out
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        let exprs = terms[0].match_expressions.clone().unwrap();
        assert_eq!(exprs[0].key, "pool");
        assert_eq!(exprs[1].key, ARCH_LABEL);
    }

    #[test]
    fn composition_is_deterministic() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "a,b".to_string());
        let aff = ComponentAffinity {
            node_affinity_labels: Some(labels),
            ..Default::default()
        };
        let arch = archs(&["arm64", "amd64", "s390x"]);
        assert_eq!(compose(Some(&aff), &arch), compose(Some(&aff), &arch));
    }
}

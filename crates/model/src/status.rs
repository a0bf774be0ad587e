//! Component status: typed conditions plus binding bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// Last full reconcile pass succeeded.
    Reconciled,
    /// Certificates and service bindings this component depends on resolve.
    DependenciesSatisfied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Moves only when `status` flips value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// At most one condition per type, kept ordered by type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Binding category -> secret names this component consumes.
    /// Append-only and deduplicated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumed_services: BTreeMap<String, Vec<String>>,
    /// Binding identifiers currently satisfied, kept sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_bindings: Vec<String>,
    /// Concrete image reference; the declared image unless an image-stream
    /// lookup refined it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

impl ComponentStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace the record for `cond.type_`, preserving order.
    pub fn put_condition(&mut self, cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(slot) => *slot = cond,
            None => {
                self.conditions.push(cond);
                self.conditions.sort_by_key(|c| c.type_);
            }
        }
    }

    /// Record a consumed binding secret, once.
    pub fn record_consumed(&mut self, category: &str, secret: &str) {
        let list = self.consumed_services.entry(category.to_string()).or_default();
        if !list.iter().any(|s| s == secret) {
            list.push(secret.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_stay_ordered_and_unique() {
        let mut st = ComponentStatus::default();
        let dep = Condition {
            type_: ConditionType::DependenciesSatisfied,
            status: ConditionStatus::False,
            reason: None,
            message: None,
            last_update_time: None,
            last_transition_time: None,
        };
        let rec = Condition {
            type_: ConditionType::Reconciled,
            status: ConditionStatus::True,
            ..dep.clone()
        };
        st.put_condition(dep.clone());
        st.put_condition(rec);
        st.put_condition(Condition {
            status: ConditionStatus::True,
            ..dep
        });
        assert_eq!(st.conditions.len(), 2);
        assert_eq!(st.conditions[0].type_, ConditionType::Reconciled);
        assert_eq!(
            st.condition(ConditionType::DependenciesSatisfied).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn consumed_services_append_once() {
        let mut st = ComponentStatus::default();
        st.record_consumed("openapi", "a-ns1");
        st.record_consumed("openapi", "b-ns2");
        st.record_consumed("openapi", "a-ns1");
        assert_eq!(st.consumed_services["openapi"], vec!["a-ns1", "b-ns2"]);
    }
}

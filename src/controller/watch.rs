//! Watch plumbing: mapping node events onto the policies that select them.
//!
//! Node churn is constant in a busy cluster; most of it (heartbeat
//! timestamps, images, capacity) is irrelevant to health evaluation. The
//! [`NodeConditionsCache`] suppresses reconciles for nodes whose
//! `(type, status)` condition pairs have not changed, and
//! [`selector_matches`] picks the policies that care about the node that
//! did change.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::crd::NodeHealthCheck;

/// Client-side label selector evaluation, covering `matchLabels` and the
/// four `matchExpressions` operators. An empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let actual = labels.get(&expression.key);
            let values = expression.values.as_deref().unwrap_or(&[]);
            let matched = match expression.operator.as_str() {
                "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

/// Last-seen `(type, status)` condition pairs per node, used to drop
/// reconcile requests for node updates that cannot change a health verdict.
#[derive(Default)]
pub struct NodeConditionsCache {
    seen: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl NodeConditionsCache {
    /// Record the node's current condition pairs; returns whether they
    /// differ from the previous observation. A first observation always
    /// reconciles.
    pub fn observe(&self, node: &Node) -> bool {
        let mut pairs: Vec<(String, String)> = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| (c.type_.clone(), c.status.clone()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort_unstable();

        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match seen.insert(node.name_any(), pairs.clone()) {
            Some(previous) => previous != pairs,
            None => true,
        }
    }
}

/// Policies whose selector matches the node, as reconcile targets.
pub fn checks_for_node(store: &Store<NodeHealthCheck>, node: &Node) -> Vec<ObjectRef<NodeHealthCheck>> {
    let labels = node.labels().clone();
    store
        .state()
        .iter()
        .filter(|check| selector_matches(&check.spec.selector, &labels))
        .map(|check| ObjectRef::from_obj(check.as_ref()))
        .collect()
}

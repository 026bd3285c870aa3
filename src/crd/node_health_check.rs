//! NodeHealthCheck Custom Resource Definition
//!
//! A NodeHealthCheck selects a set of nodes, declares what "unhealthy"
//! means for them, and names the remediation template(s) used to request
//! remediation when a node goes unhealthy.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, EscalatingRemediation, Phase, RemediationTemplateRef, UnhealthyCondition,
    UnhealthyNode, TEMPLATE_KIND_SUFFIX,
};
use crate::error::Result;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nodehealth.io",
    version = "v1alpha1",
    kind = "NodeHealthCheck",
    status = "NodeHealthCheckStatus",
    shortname = "nhc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedNodes"}"#,
    printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.healthyNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthCheckSpec {
    /// Label predicate choosing the target nodes.
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub selector: LabelSelector,

    /// Clauses under which a node counts as unhealthy; any match suffices.
    #[serde(default = "default_unhealthy_conditions")]
    pub unhealthy_conditions: Vec<UnhealthyCondition>,

    /// Minimum number (or percentage of observed nodes) that must stay
    /// healthy for remediation to proceed.
    #[serde(default = "default_min_healthy")]
    #[schemars(with = "serde_json::Value")]
    pub min_healthy: IntOrString,

    /// Opaque pause tokens; remediation is disabled while any are present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pause_requests: Vec<String>,

    /// Single remediation template. Mutually exclusive with
    /// `escalatingRemediations`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_template: Option<RemediationTemplateRef>,

    /// Ordered sequence of remediation templates with per-step timeouts.
    /// Mutually exclusive with `remediationTemplate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalating_remediations: Option<Vec<EscalatingRemediation>>,
}

fn default_unhealthy_conditions() -> Vec<UnhealthyCondition> {
    vec![
        UnhealthyCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            duration: "300s".to_string(),
        },
        UnhealthyCondition {
            type_: "Ready".to_string(),
            status: "Unknown".to_string(),
            duration: "300s".to_string(),
        },
    ]
}

fn default_min_healthy() -> IntOrString {
    IntOrString::String("51%".to_string())
}

impl NodeHealthCheckSpec {
    /// Validate the spec.
    ///
    /// Mirrors what the admission webhook rejects so that an object that
    /// slipped past admission still surfaces a clear `Disabled` reason
    /// instead of undefined controller behaviour.
    pub fn validate(&self) -> Result<(), String> {
        match &self.min_healthy {
            IntOrString::Int(v) if *v < 0 => {
                return Err(format!("minHealthy must not be negative, got {v}"));
            }
            IntOrString::String(s) => {
                let percent = percent_value(s)
                    .ok_or_else(|| format!("minHealthy must be an integer or a percentage, got {s:?}"))?;
                if percent > 100 {
                    return Err(format!("minHealthy must not exceed 100%, got {s}"));
                }
            }
            _ => {}
        }

        for clause in &self.unhealthy_conditions {
            if !matches!(clause.status.as_str(), "True" | "False" | "Unknown") {
                return Err(format!(
                    "unhealthyConditions[{}].status must be True, False or Unknown",
                    clause.type_
                ));
            }
            clause.duration().map_err(|e| e.to_string())?;
        }

        match (&self.remediation_template, &self.escalating_remediations) {
            (Some(_), Some(_)) => {
                return Err(
                    "remediationTemplate and escalatingRemediations are mutually exclusive"
                        .to_string(),
                );
            }
            (None, None) => {
                return Err(
                    "one of remediationTemplate or escalatingRemediations must be set".to_string(),
                );
            }
            (Some(template), None) => {
                validate_template_ref(template)?;
            }
            (None, Some(escalations)) => {
                if escalations.is_empty() {
                    return Err("escalatingRemediations must not be empty".to_string());
                }
                let mut orders = BTreeSet::new();
                for escalation in escalations {
                    validate_template_ref(&escalation.remediation_template)?;
                    escalation.timeout().map_err(|e| e.to_string())?;
                    if !orders.insert(escalation.order) {
                        return Err(format!(
                            "escalatingRemediations order values must be unique, {} repeats",
                            escalation.order
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// All referenced templates, in escalation order.
    pub fn template_refs(&self) -> Vec<&RemediationTemplateRef> {
        match (&self.remediation_template, &self.escalating_remediations) {
            (Some(template), _) => vec![template],
            (None, Some(escalations)) => {
                let mut sorted: Vec<&EscalatingRemediation> = escalations.iter().collect();
                sorted.sort_by_key(|e| e.order);
                sorted.iter().map(|e| &e.remediation_template).collect()
            }
            (None, None) => Vec::new(),
        }
    }
}

fn validate_template_ref(template: &RemediationTemplateRef) -> Result<(), String> {
    if !template.kind.ends_with(TEMPLATE_KIND_SUFFIX) {
        return Err(format!(
            "template kind {} must end in {}",
            template.kind, TEMPLATE_KIND_SUFFIX
        ));
    }
    if template.name.is_empty() || template.namespace.is_empty() {
        return Err(format!(
            "template reference {} must carry a name and namespace",
            template.kind
        ));
    }
    Ok(())
}

/// Parse "NN%" into its numeric value.
pub fn percent_value(value: &str) -> Option<u32> {
    value.strip_suffix('%')?.trim().parse().ok()
}

/// Resolve `minHealthy` against the observed node count. Percentages round
/// up, so "51%" of 3 nodes is 2.
pub fn resolve_min_healthy(min_healthy: &IntOrString, observed: usize) -> Result<usize, String> {
    match min_healthy {
        IntOrString::Int(v) => {
            if *v < 0 {
                Err(format!("minHealthy must not be negative, got {v}"))
            } else {
                Ok(*v as usize)
            }
        }
        IntOrString::String(s) => {
            let percent = percent_value(s)
                .ok_or_else(|| format!("minHealthy must be an integer or a percentage, got {s:?}"))?
                as usize;
            Ok((percent * observed).div_ceil(100))
        }
    }
}

/// Reconciler-owned status of a NodeHealthCheck.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthCheckStatus {
    /// Number of nodes the selector currently matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_nodes: Option<i32>,

    /// Number of those nodes currently evaluated healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_nodes: Option<i32>,

    /// Remediation request objects owned by this check, by name, with
    /// their RFC 3339 creation times.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub in_flight_remediations: BTreeMap<String, String>,

    /// Per-node records of ongoing remediation attempts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_nodes: Vec<UnhealthyNode>,

    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_ref(kind: &str) -> RemediationTemplateRef {
        RemediationTemplateRef {
            api_version: "self-node-remediation.nodehealth.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: "default".to_string(),
            namespace: "remediation".to_string(),
        }
    }

    fn minimal_spec() -> NodeHealthCheckSpec {
        NodeHealthCheckSpec {
            selector: LabelSelector::default(),
            unhealthy_conditions: default_unhealthy_conditions(),
            min_healthy: default_min_healthy(),
            pause_requests: Vec::new(),
            remediation_template: Some(template_ref("SelfNodeRemediationTemplate")),
            escalating_remediations: None,
        }
    }

    #[test]
    fn test_defaults() {
        let conditions = default_unhealthy_conditions();
        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().all(|c| c.type_ == "Ready"));
        assert_eq!(default_min_healthy(), IntOrString::String("51%".to_string()));
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(minimal_spec().validate().is_ok());
    }

    #[test]
    fn test_both_template_forms_rejected() {
        let spec = NodeHealthCheckSpec {
            escalating_remediations: Some(vec![EscalatingRemediation {
                remediation_template: template_ref("SelfNodeRemediationTemplate"),
                order: 0,
                timeout: "5m".to_string(),
            }]),
            ..minimal_spec()
        };
        assert!(spec.validate().unwrap_err().contains("mutually exclusive"));
    }

    #[test]
    fn test_neither_template_form_rejected() {
        let spec = NodeHealthCheckSpec {
            remediation_template: None,
            ..minimal_spec()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_duplicate_orders_rejected() {
        let spec = NodeHealthCheckSpec {
            remediation_template: None,
            escalating_remediations: Some(vec![
                EscalatingRemediation {
                    remediation_template: template_ref("SelfNodeRemediationTemplate"),
                    order: 1,
                    timeout: "5m".to_string(),
                },
                EscalatingRemediation {
                    remediation_template: template_ref("MachineDeletionRemediationTemplate"),
                    order: 1,
                    timeout: "10m".to_string(),
                },
            ]),
            ..minimal_spec()
        };
        assert!(spec.validate().unwrap_err().contains("unique"));
    }

    #[test]
    fn test_min_healthy_bounds() {
        let over = NodeHealthCheckSpec {
            min_healthy: IntOrString::String("150%".to_string()),
            ..minimal_spec()
        };
        assert!(over.validate().unwrap_err().contains("100%"));

        let negative = NodeHealthCheckSpec {
            min_healthy: IntOrString::Int(-1),
            ..minimal_spec()
        };
        assert!(negative.validate().unwrap_err().contains("negative"));
    }

    #[test]
    fn test_template_kind_suffix_required() {
        let spec = NodeHealthCheckSpec {
            remediation_template: Some(template_ref("SelfNodeRemediation")),
            ..minimal_spec()
        };
        assert!(spec.validate().unwrap_err().contains("Template"));
    }

    #[test]
    fn test_resolve_min_healthy_percentage_rounds_up() {
        let pct = IntOrString::String("51%".to_string());
        assert_eq!(resolve_min_healthy(&pct, 3).unwrap(), 2);
        assert_eq!(resolve_min_healthy(&pct, 7).unwrap(), 4);
        assert_eq!(resolve_min_healthy(&pct, 0).unwrap(), 0);
    }

    #[test]
    fn test_resolve_min_healthy_boundaries() {
        let zero = IntOrString::String("0%".to_string());
        assert_eq!(resolve_min_healthy(&zero, 5).unwrap(), 0);

        let all = IntOrString::String("100%".to_string());
        assert_eq!(resolve_min_healthy(&all, 5).unwrap(), 5);

        let absolute = IntOrString::Int(3);
        assert_eq!(resolve_min_healthy(&absolute, 5).unwrap(), 3);
    }

    #[test]
    fn test_template_refs_sorted_by_order() {
        let spec = NodeHealthCheckSpec {
            remediation_template: None,
            escalating_remediations: Some(vec![
                EscalatingRemediation {
                    remediation_template: template_ref("MachineDeletionRemediationTemplate"),
                    order: 5,
                    timeout: "15s".to_string(),
                },
                EscalatingRemediation {
                    remediation_template: template_ref("SelfNodeRemediationTemplate"),
                    order: 0,
                    timeout: "5s".to_string(),
                },
            ]),
            ..minimal_spec()
        };
        let refs = spec.template_refs();
        assert_eq!(refs[0].kind, "SelfNodeRemediationTemplate");
        assert_eq!(refs[1].kind, "MachineDeletionRemediationTemplate");
    }
}

//! Shared types for the NodeHealthCheck API surface.
//!
//! These types appear inside the CRD spec and status and are also consumed
//! directly by the controller. Duration-valued fields are Go-style strings
//! ("300s", "5m", "48h") so manifests read the same way the rest of the
//! cluster API does; they are parsed on use.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{ApiResource, GroupVersionKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Suffix every remediation template kind must carry. Stripping it yields
/// the kind of the remediation request object the template produces.
pub const TEMPLATE_KIND_SUFFIX: &str = "Template";

/// One clause of the unhealthy predicate: a node is unhealthy if any clause
/// matches its conditions for at least `duration`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyCondition {
    /// Node condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status that counts as unhealthy: `True`, `False` or
    /// `Unknown`.
    pub status: String,
    /// How long the condition must hold before the node counts as
    /// unhealthy.
    pub duration: String,
}

impl UnhealthyCondition {
    pub fn duration(&self) -> Result<Duration> {
        parse_go_duration(&self.duration)
    }
}

/// Reference to a remediation template object.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationTemplateRef {
    /// `group/version` of the template, e.g.
    /// `self-node-remediation.nodehealth.io/v1alpha1`.
    pub api_version: String,
    /// Template kind; must end in `Template`.
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl RemediationTemplateRef {
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(_, version)| version)
            .unwrap_or(self.api_version.as_str())
    }

    /// Kind of the materialised remediation request: the template kind with
    /// the trailing `Template` stripped.
    pub fn remediation_kind(&self) -> String {
        self.kind
            .strip_suffix(TEMPLATE_KIND_SUFFIX)
            .unwrap_or(&self.kind)
            .to_string()
    }

    pub fn template_api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind {
            group: self.group().to_string(),
            version: self.version().to_string(),
            kind: self.kind.clone(),
        })
    }

    pub fn remediation_api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind {
            group: self.group().to_string(),
            version: self.version().to_string(),
            kind: self.remediation_kind(),
        })
    }
}

/// One step of the ordered escalation sequence.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EscalatingRemediation {
    pub remediation_template: RemediationTemplateRef,
    /// Position in the sequence; lower orders run first. Must be unique.
    pub order: i32,
    /// How long this step may run before failing over to the next one.
    pub timeout: String,
}

impl EscalatingRemediation {
    pub fn timeout(&self) -> Result<Duration> {
        parse_go_duration(&self.timeout)
    }
}

/// Record of one remediation attempt for a node, persisted in status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationAttempt {
    pub template: RemediationTemplateRef,
    /// RFC 3339 time the attempt began.
    pub started: String,
    /// RFC 3339 time the attempt was declared timed out, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<String>,
}

impl RemediationAttempt {
    pub fn started_at(&self) -> Result<DateTime<Utc>> {
        parse_rfc3339(&self.started)
    }
}

/// Per-node record of ongoing remediation, persisted in status.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediations: Vec<RemediationAttempt>,
}

/// Observable lifecycle phase of a NodeHealthCheck.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    Disabled,
    Paused,
    #[default]
    Enabled,
    Remediating,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Disabled => write!(f, "Disabled"),
            Phase::Paused => write!(f, "Paused"),
            Phase::Enabled => write!(f, "Enabled"),
            Phase::Remediating => write!(f, "Remediating"),
        }
    }
}

/// Status condition following Kubernetes API conventions.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

/// Parse a Go-style duration string ("300s", "5m", "48h").
pub fn parse_go_duration(value: &str) -> Result<Duration> {
    parse_duration::parse(value).map_err(|source| Error::DurationParse {
        value: value.to_string(),
        source,
    })
}

/// Parse an RFC 3339 timestamp as stored in status fields.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| Error::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_go_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_go_duration("48h").unwrap(),
            Duration::from_secs(48 * 3600)
        );
        assert!(parse_go_duration("not-a-duration").is_err());
    }

    #[test]
    fn test_remediation_kind_strips_suffix() {
        let tref = RemediationTemplateRef {
            api_version: "self-node-remediation.nodehealth.io/v1alpha1".to_string(),
            kind: "SelfNodeRemediationTemplate".to_string(),
            name: "default".to_string(),
            namespace: "remediation".to_string(),
        };
        assert_eq!(tref.remediation_kind(), "SelfNodeRemediation");
        assert_eq!(tref.group(), "self-node-remediation.nodehealth.io");
        assert_eq!(tref.version(), "v1alpha1");
    }

    #[test]
    fn test_remediation_kind_without_suffix_is_unchanged() {
        let tref = RemediationTemplateRef {
            api_version: "x.io/v1".to_string(),
            kind: "Widget".to_string(),
            name: "w".to_string(),
            namespace: "ns".to_string(),
        };
        assert_eq!(tref.remediation_kind(), "Widget");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Remediating.to_string(), "Remediating");
        assert_eq!(Phase::default(), Phase::Enabled);
    }

    #[test]
    fn test_parse_rfc3339_round_trip() {
        let now = Utc::now();
        let parsed = parse_rfc3339(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed, now);
        assert!(parse_rfc3339("garbage").is_err());
    }
}

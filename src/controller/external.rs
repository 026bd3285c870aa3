//! Environment collaborators.
//!
//! The reconciler consumes these as trait objects so that platform probes
//! (cluster upgrade state, external machine-health-checkers) stay outside
//! the core and tests can substitute canned answers.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use crate::error::Result;

/// Reports whether the cluster is currently upgrading. Nodes go briefly
/// unhealthy while an upgrade drains and reboots them, so remediation is
/// held back until the probe reports the upgrade finished.
#[async_trait]
pub trait ClusterUpgradeProbe: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Probe for conflicting external machine-health-checkers.
#[async_trait]
pub trait MachineHealthCheckProbe: Send + Sync {
    /// Whether any enabled external machine-health-check object exists, in
    /// which case this controller disables itself entirely.
    async fn need_disable_nhc(&self) -> Result<bool>;

    /// Whether this particular node is managed by an external checker and
    /// must not be remediated by us.
    fn need_ignore_node(&self, node: &Node) -> bool;
}

/// Probe for clusters without an upgrade orchestrator: never upgrading.
pub struct NoClusterUpgrade;

#[async_trait]
impl ClusterUpgradeProbe for NoClusterUpgrade {
    async fn check(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Probe for clusters without external machine-health-checkers.
pub struct NoExternalMachineHealthCheck;

#[async_trait]
impl MachineHealthCheckProbe for NoExternalMachineHealthCheck {
    async fn need_disable_nhc(&self) -> Result<bool> {
        Ok(false)
    }

    fn need_ignore_node(&self, _node: &Node) -> bool {
        false
    }
}

//! Main reconciler for NodeHealthCheck resources
//!
//! Implements the controller pattern using kube-rs runtime. The reconciler
//! is level-triggered: each pass maps freshly observed cluster state onto
//! the set of remediation requests that should exist, applies a bounded set
//! of writes, and returns a requeue hint. All retries are owned by the
//! framework's back-off, never by local loops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{
    is_condition_true, set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_DISABLED, REASON_CONFLICTING_MHC, REASON_ENABLED, REASON_INVALID_SPEC,
    REASON_TEMPLATE_INVALID, REASON_TEMPLATE_NOT_FOUND,
};
use super::escalation;
use super::events::{
    emit_event, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING, REASON_DISABLED,
    REASON_REMEDIATION_REMOVED, REASON_REMEDIATION_SKIPPED,
};
use super::external::{
    ClusterUpgradeProbe, MachineHealthCheckProbe, NoClusterUpgrade,
    NoExternalMachineHealthCheck,
};
use super::health;
use super::lease::LeaseManager;
use super::remediation;
use super::watch::{checks_for_node, selector_matches, NodeConditionsCache};
use crate::config;
use crate::crd::{
    resolve_min_healthy, NodeHealthCheck, NodeHealthCheckStatus, Phase, RemediationAttempt,
    UnhealthyNode,
};
use crate::error::{Error, Result};

/// Controller name used in metric labels and field manager strings.
pub const CONTROLLER: &str = "nodehealthcheck";

const FIELD_MANAGER: &str = "nodehealth-operator";

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub lease_manager: LeaseManager,
    pub upgrade_probe: Arc<dyn ClusterUpgradeProbe>,
    pub mhc_probe: Arc<dyn MachineHealthCheckProbe>,
    /// Leader-election switch; while false the reconciler only requeues.
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    /// State with default collaborators (no upgrade orchestrator, no
    /// external machine-health-checkers) and leadership assumed.
    pub fn new(client: Client) -> Self {
        let leases_namespace = config::tunables().leases_namespace;
        Self {
            lease_manager: LeaseManager::new(client.clone(), leases_namespace),
            client,
            upgrade_probe: Arc::new(NoClusterUpgrade),
            mhc_probe: Arc::new(NoExternalMachineHealthCheck),
            is_leader: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let checks: Api<NodeHealthCheck> = Api::all(client.clone());

    info!("Starting NodeHealthCheck controller");

    // Verify CRD exists
    match checks.list(&Default::default()).await {
        Ok(_) => info!("NodeHealthCheck CRD is available"),
        Err(e) => {
            error!(
                "NodeHealthCheck CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "NodeHealthCheck CRD not installed".to_string(),
            ));
        }
    }

    let controller = Controller::new(checks, Config::default());
    let store = controller.store();
    let conditions_cache = Arc::new(NodeConditionsCache::default());

    controller
        // Node changes fan out to the checks selecting that node, unless
        // the (type, status) condition pairs are unchanged.
        .watches(
            Api::<Node>::all(client.clone()),
            Config::default(),
            move |node| {
                if !conditions_cache.observe(&node) {
                    return Vec::new();
                }
                checks_for_node(&store, &node)
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a NodeHealthCheck changes, a selected node's conditions
/// change, or a requeue timer expires.
#[instrument(skip(ctx), fields(name = %obj.name_any()))]
async fn reconcile(obj: Arc<NodeHealthCheck>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        return Ok(Action::requeue(config::tunables().resync_period));
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = reconcile_inner(obj, ctx).await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            CONTROLLER,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            super::metrics::inc_reconcile_error(CONTROLLER, e.metric_kind());
        }
    }

    result
}

async fn reconcile_inner(obj: Arc<NodeHealthCheck>, ctx: Arc<ControllerState>) -> Result<Action> {
    let tunables = config::tunables();
    let client = ctx.client.clone();
    let api: Api<NodeHealthCheck> = Api::all(client.clone());

    // A fresh reconcile starts from a freshly loaded object; stale cache
    // contents converge on the next pass.
    let Some(check) = api.get_opt(&obj.name_any()).await? else {
        return Ok(Action::await_change());
    };

    let old_status = check.status.clone().unwrap_or_default();
    let mut status = old_status.clone();

    // Standing in for the admission webhook: an invalid spec disables the
    // check instead of producing undefined behaviour.
    if let Err(message) = check.spec.validate() {
        return disable(&client, &api, &check, &old_status, status, REASON_INVALID_SPEC, &message)
            .await;
    }

    // Conflicting-external-checker gate.
    if ctx.mhc_probe.need_disable_nhc().await? {
        let message =
            "an enabled MachineHealthCheck exists; NodeHealthCheck stands down".to_string();
        return disable(
            &client,
            &api,
            &check,
            &old_status,
            status,
            REASON_CONFLICTING_MHC,
            &message,
        )
        .await;
    }

    // Template-validation gate: probe every referenced template.
    for template_ref in check.spec.template_refs() {
        if let Err(err) = remediation::validate_template(&client, &check, template_ref).await {
            let reason = match &err {
                Error::TemplateNotFound { .. } => REASON_TEMPLATE_NOT_FOUND,
                Error::TemplateMalformed { .. } | Error::TemplateInvalid(_) => {
                    REASON_TEMPLATE_INVALID
                }
                _ => return Err(err),
            };
            let message = err.to_string();
            return disable(&client, &api, &check, &old_status, status, reason, &message).await;
        }
    }

    // Gates cleared: flip the Disabled condition back if it was set.
    if is_condition_true(&status.conditions, CONDITION_TYPE_DISABLED) {
        set_condition(
            &mut status.conditions,
            CONDITION_TYPE_DISABLED,
            CONDITION_STATUS_FALSE,
            REASON_ENABLED,
            "all gates clear",
        );
        emit_event(
            &client,
            &check,
            EVENT_TYPE_NORMAL,
            super::events::REASON_ENABLED,
            "NodeHealthCheck is enabled",
        )
        .await;
    }

    // Selection: all nodes matching the selector, filtered client-side to
    // honour matchExpressions.
    let nodes: Api<Node> = Api::all(client.clone());
    let selected: Vec<Node> = nodes
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|node| selector_matches(&check.spec.selector, node.labels()))
        .collect();

    // Evaluation.
    let now = Utc::now();
    let mut requeue: Option<Duration> = None;
    let mut unhealthy: Vec<&Node> = Vec::new();
    let mut healthy_count = 0usize;
    for node in &selected {
        // Nodes owned by an external health-checker are not ours to judge.
        if ctx.mhc_probe.need_ignore_node(node) {
            healthy_count += 1;
            continue;
        }
        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        let outcome =
            health::evaluate_node(conditions, &check.spec.unhealthy_conditions, now)?;
        if outcome.healthy {
            healthy_count += 1;
            if let Some(next) = outcome.next_transition {
                fold_requeue(&mut requeue, next);
            }
        } else {
            unhealthy.push(node);
        }
    }

    // Working copy of the per-node attempt records.
    let mut records: BTreeMap<String, Vec<RemediationAttempt>> = status
        .unhealthy_nodes
        .iter()
        .map(|n| (n.name.clone(), n.remediations.clone()))
        .collect();

    // Safety gates, in order: minimum-healthy threshold, pause requests,
    // cluster upgrade.
    let mut remediation_allowed = !unhealthy.is_empty();
    let mut gate_reason: Option<String> = None;
    if !unhealthy.is_empty() {
        let min_healthy = resolve_min_healthy(&check.spec.min_healthy, selected.len())
            .map_err(Error::ValidationError)?;
        if healthy_count < min_healthy {
            remediation_allowed = false;
            let message = format!(
                "skipping remediation: healthy < minHealthy ({healthy_count} < {min_healthy})"
            );
            if old_status.reason.as_deref() != Some(&message) {
                emit_event(
                    &client,
                    &check,
                    EVENT_TYPE_WARNING,
                    REASON_REMEDIATION_SKIPPED,
                    &message,
                )
                .await;
            }
            gate_reason = Some(message);
        } else if !check.spec.pause_requests.is_empty() {
            remediation_allowed = false;
            gate_reason = Some(format!(
                "remediation paused by {} pause request(s)",
                check.spec.pause_requests.len()
            ));
        } else {
            // An upgrade probe failure reads as "not upgrading": nodes going
            // unhealthy mid-upgrade are already guarded by the requeue below.
            let upgrading = match ctx.upgrade_probe.check().await {
                Ok(upgrading) => upgrading,
                Err(e) => {
                    warn!("cluster-upgrade probe failed, assuming no upgrade: {e}");
                    false
                }
            };
            if upgrading {
                remediation_allowed = false;
                gate_reason = Some("cluster is upgrading; remediation deferred".to_string());
                fold_requeue(&mut requeue, tunables.upgrade_requeue_interval);
            }
        }
    }

    // Control-plane quorum: at most one control-plane node remediates at a
    // time per check.
    let cp_unhealthy: Vec<String> = unhealthy
        .iter()
        .filter(|n| is_control_plane(n))
        .map(|n| n.name_any())
        .collect();
    let allowed_cp = pick_control_plane(&cp_unhealthy, &records);

    // Fan out to the escalation engine.
    for node in &unhealthy {
        let node_name = node.name_any();
        let entry = records.entry(node_name.clone()).or_default();
        if !remediation_allowed {
            continue;
        }
        if is_control_plane(node) && allowed_cp.as_deref() != Some(node_name.as_str()) {
            info!(
                node = %node_name,
                "deferring control-plane remediation, another control-plane node is in progress"
            );
            continue;
        }
        let outcome =
            escalation::remediate_node(&client, &ctx.lease_manager, &check, node, entry, now)
                .await?;
        if let Some(hint) = outcome.requeue_after {
            fold_requeue(&mut requeue, hint);
        }
    }

    // In-flight census: the request objects this check actually owns.
    let mut in_flight: BTreeMap<String, String> = BTreeMap::new();
    let mut listed: BTreeSet<(String, String, String)> = BTreeSet::new();
    for template_ref in check.spec.template_refs() {
        let key = (
            template_ref.api_version.clone(),
            template_ref.remediation_kind(),
            template_ref.namespace.clone(),
        );
        if !listed.insert(key) {
            continue;
        }
        for request in remediation::list_owned_requests(&client, &check, template_ref).await? {
            let created = request
                .meta()
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339())
                .unwrap_or_default();
            in_flight.insert(request.name_any(), created);
        }
    }

    // Healthy reconciliation: nodes with remediation artifacts that are no
    // longer unhealthy (recovered, deselected or gone) get cleaned up.
    let unhealthy_names: BTreeSet<String> = unhealthy.iter().map(|n| n.name_any()).collect();
    let stale_names: Vec<String> = records
        .keys()
        .chain(in_flight.keys())
        .filter(|name| !unhealthy_names.contains(*name))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for node_name in stale_names {
        let deleted = remediation::delete_requests_for_node(&client, &check, &node_name).await?;
        ctx.lease_manager.release(&node_name).await?;
        records.remove(&node_name);
        in_flight.remove(&node_name);
        if deleted {
            emit_event(
                &client,
                &check,
                EVENT_TYPE_NORMAL,
                REASON_REMEDIATION_REMOVED,
                &format!("node {node_name} recovered, remediation removed"),
            )
            .await;
        }
    }

    // Status.
    status.observed_nodes = Some(selected.len() as i32);
    status.healthy_nodes = Some(healthy_count as i32);
    status.unhealthy_nodes = records
        .into_iter()
        .map(|(name, remediations)| UnhealthyNode { name, remediations })
        .collect();
    status.in_flight_remediations = in_flight;
    status.phase = compute_phase(&check, &status);
    status.reason = gate_reason.or_else(|| default_reason(&status.phase));

    patch_status(&api, &check, &old_status, &status).await?;

    Ok(match requeue {
        Some(hint) => Action::requeue(hint.min(tunables.resync_period)),
        None => Action::requeue(tunables.resync_period),
    })
}

/// Disable the check: set the condition, flip phase, record the event on
/// the transition, patch, and settle until the next natural trigger.
#[allow(clippy::too_many_arguments)]
async fn disable(
    client: &Client,
    api: &Api<NodeHealthCheck>,
    check: &NodeHealthCheck,
    old_status: &NodeHealthCheckStatus,
    mut status: NodeHealthCheckStatus,
    reason: &str,
    message: &str,
) -> Result<Action> {
    let flipped = set_condition(
        &mut status.conditions,
        CONDITION_TYPE_DISABLED,
        CONDITION_STATUS_TRUE,
        reason,
        message,
    );
    status.phase = Phase::Disabled;
    status.reason = Some(message.to_string());

    if flipped {
        warn!(check = %check.name_any(), reason, "disabling NodeHealthCheck: {message}");
        emit_event(client, check, EVENT_TYPE_WARNING, REASON_DISABLED, message).await;
    }

    patch_status(api, check, old_status, &status).await?;
    Ok(Action::requeue(config::tunables().resync_period))
}

/// Patch the status subresource iff anything changed. Conflicts are
/// swallowed; the next reconcile starts from fresher state anyway.
async fn patch_status(
    api: &Api<NodeHealthCheck>,
    check: &NodeHealthCheck,
    old_status: &NodeHealthCheckStatus,
    new_status: &NodeHealthCheckStatus,
) -> Result<()> {
    if old_status == new_status {
        return Ok(());
    }
    let patch = status_merge_patch(old_status, new_status)?;
    match api
        .patch_status(
            &check.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(check = %check.name_any(), "status patch conflicted, deferring");
            Ok(())
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Build the merge patch for a status transition. Keys that disappeared
/// from map- and option-valued fields are nulled explicitly so the merge
/// patch actually removes them.
pub fn status_merge_patch(
    old_status: &NodeHealthCheckStatus,
    new_status: &NodeHealthCheckStatus,
) -> Result<serde_json::Value> {
    let mut status = serde_json::to_value(new_status)?;

    for key in old_status.in_flight_remediations.keys() {
        if !new_status.in_flight_remediations.contains_key(key) {
            status["inFlightRemediations"][key] = serde_json::Value::Null;
        }
    }
    if !old_status.unhealthy_nodes.is_empty() && new_status.unhealthy_nodes.is_empty() {
        status["unhealthyNodes"] = serde_json::Value::Null;
    }
    if old_status.reason.is_some() && new_status.reason.is_none() {
        status["reason"] = serde_json::Value::Null;
    }

    Ok(serde_json::json!({ "status": status }))
}

/// Observable phase from the final status shape.
pub fn compute_phase(check: &NodeHealthCheck, status: &NodeHealthCheckStatus) -> Phase {
    if !check.spec.pause_requests.is_empty() {
        Phase::Paused
    } else if !status.in_flight_remediations.is_empty()
        || status
            .unhealthy_nodes
            .iter()
            .any(|n| !n.remediations.is_empty())
    {
        Phase::Remediating
    } else {
        Phase::Enabled
    }
}

fn default_reason(phase: &Phase) -> Option<String> {
    match phase {
        Phase::Paused => Some("pause requests present".to_string()),
        Phase::Remediating => Some("remediation in progress".to_string()),
        _ => None,
    }
}

/// Whether the node carries a control-plane role label.
pub fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| labels.contains_key(*label))
}

/// The one control-plane node allowed to remediate this reconcile: an
/// in-progress one if any, otherwise the lowest name.
pub fn pick_control_plane(
    cp_unhealthy: &[String],
    records: &BTreeMap<String, Vec<RemediationAttempt>>,
) -> Option<String> {
    let mut in_progress: Vec<&String> = cp_unhealthy
        .iter()
        .filter(|name| {
            records
                .get(*name)
                .map(|attempts| !attempts.is_empty())
                .unwrap_or(false)
        })
        .collect();
    in_progress.sort();
    if let Some(first) = in_progress.first() {
        return Some((*first).clone());
    }
    cp_unhealthy.iter().min().cloned()
}

fn fold_requeue(current: &mut Option<Duration>, candidate: Duration) {
    *current = Some(match current {
        Some(existing) => (*existing).min(candidate),
        None => candidate,
    });
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(check: Arc<NodeHealthCheck>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", check.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

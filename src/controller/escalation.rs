//! The escalating remediation state machine.
//!
//! Per unhealthy node the controller walks the ordered template sequence:
//! begin an attempt under the node's lease, watch it until its step timeout
//! (or an early `Succeeded=False` hard timeout), annotate and fail over to
//! the next step, and finally sit in "exhausted" with the last request
//! retained. All timing is expressed as requeue hints; attempt history is
//! persisted in the policy status so any instance can resume it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::DynamicObject;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::events::{self, EVENT_TYPE_NORMAL, REASON_REMEDIATION_CREATED};
use super::lease::LeaseManager;
use super::remediation::{
    annotate_request, ensure_request, get_request, OLD_REMEDIATION_ANNOTATION,
    OLD_REMEDIATION_FLAG, TIMED_OUT_ANNOTATION,
};
use crate::config::{self, Tunables};
use crate::crd::{
    parse_rfc3339, NodeHealthCheck, NodeHealthCheckSpec, RemediationAttempt,
    RemediationTemplateRef,
};
use crate::error::Result;

/// One resolved step of the escalation sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationStep {
    pub template: RemediationTemplateRef,
    /// `None` for the single-template form, which never times out.
    pub timeout: Option<Duration>,
}

/// Resolve the policy's template form into ordered steps.
pub fn escalation_steps(spec: &NodeHealthCheckSpec) -> Result<Vec<EscalationStep>> {
    if let Some(template) = &spec.remediation_template {
        return Ok(vec![EscalationStep {
            template: template.clone(),
            timeout: None,
        }]);
    }
    let mut escalations = spec.escalating_remediations.clone().unwrap_or_default();
    escalations.sort_by_key(|e| e.order);
    escalations
        .into_iter()
        .map(|e| {
            Ok(EscalationStep {
                timeout: Some(e.timeout()?),
                template: e.remediation_template,
            })
        })
        .collect()
}

/// What the engine decided to do this reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Move {
    /// Start the attempt for this step.
    Begin { step: usize },
    /// The current attempt keeps running; recheck at its deadline.
    Continue {
        step: usize,
        deadline: Option<DateTime<Utc>>,
    },
    /// The current attempt is out of time (step timeout or progression hard
    /// timeout); mark it and move on.
    TimeOut { step: usize },
    /// Every step has run out; the last request is retained.
    Exhausted,
}

/// Decide the next move from persisted attempts. Pure; `succeeded_false_since`
/// is the `Succeeded=False` transition time read off the current request
/// object, when there is one.
pub fn plan(
    steps: &[EscalationStep],
    attempts: &[RemediationAttempt],
    now: DateTime<Utc>,
    succeeded_false_since: Option<DateTime<Utc>>,
    progressing_hard_timeout: Duration,
) -> Result<Move> {
    let Some(last) = attempts.last() else {
        return Ok(if steps.is_empty() {
            Move::Exhausted
        } else {
            Move::Begin { step: 0 }
        });
    };

    if last.timed_out.is_some() {
        return Ok(if attempts.len() < steps.len() {
            Move::Begin {
                step: attempts.len(),
            }
        } else {
            Move::Exhausted
        });
    }

    let step = (attempts.len() - 1).min(steps.len().saturating_sub(1));
    let started = last.started_at()?;
    let deadline = steps
        .get(step)
        .and_then(|s| s.timeout)
        .and_then(|t| chrono::Duration::from_std(t).ok())
        .map(|t| started + t);

    let hard_timeout = chrono::Duration::from_std(progressing_hard_timeout)
        .unwrap_or_else(|_| chrono::Duration::max_value());
    let stalled = succeeded_false_since
        .map(|since| now.signed_duration_since(since) >= hard_timeout)
        .unwrap_or(false);

    if stalled || deadline.map(|d| now >= d).unwrap_or(false) {
        Ok(Move::TimeOut { step })
    } else {
        Ok(Move::Continue { step, deadline })
    }
}

/// `Succeeded=False` transition time from a request object's status, if the
/// remediator exposes one.
pub fn succeeded_false_since(request: &DynamicObject) -> Option<DateTime<Utc>> {
    let conditions = request.data.get("status")?.get("conditions")?.as_array()?;
    let condition = conditions.iter().find(|c| {
        c.get("type").and_then(|t| t.as_str()) == Some("Succeeded")
            && c.get("status").and_then(|s| s.as_str()) == Some("False")
    })?;
    let transition = condition.get("lastTransitionTime")?.as_str()?;
    parse_rfc3339(transition).ok()
}

/// Outcome of driving one unhealthy node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRemediationOutcome {
    /// Earliest time anything about this node needs rechecking.
    pub requeue_after: Option<Duration>,
    /// Whether a new request object was created this reconcile.
    pub created: bool,
}

fn fold_requeue(current: &mut Option<Duration>, candidate: Duration) {
    *current = Some(match current {
        Some(existing) => (*existing).min(candidate),
        None => candidate,
    });
}

/// The lease hold needed to cover a step.
fn step_hold(step: Option<&EscalationStep>, tunables: &Tunables) -> Duration {
    step.and_then(|s| s.timeout)
        .unwrap_or(Duration::ZERO)
        .max(tunables.default_lease_duration)
}

/// Drive remediation of one unhealthy node forward.
///
/// `attempts` is the node's persisted attempt history; it is mutated in
/// place and the caller patches it back into status.
pub async fn remediate_node(
    client: &Client,
    lease_manager: &LeaseManager,
    check: &NodeHealthCheck,
    node: &Node,
    attempts: &mut Vec<RemediationAttempt>,
    now: DateTime<Utc>,
) -> Result<NodeRemediationOutcome> {
    let tunables = config::tunables();
    let steps = escalation_steps(&check.spec)?;
    let node_name = node.name_any();
    let mut outcome = NodeRemediationOutcome::default();

    loop {
        // Peek at the current request object when an attempt is in flight;
        // its status feeds the progression check.
        let in_flight = attempts.last().filter(|a| a.timed_out.is_none());
        let current_request = match in_flight {
            Some(attempt) => get_request(client, &attempt.template, &node_name).await?,
            None => None,
        };
        let succeeded_false = current_request.as_ref().and_then(succeeded_false_since);

        match plan(
            &steps,
            attempts,
            now,
            succeeded_false,
            tunables.progressing_hard_timeout,
        )? {
            Move::Begin { step } => {
                let hold = step_hold(steps.get(step), &tunables);
                let lease = lease_manager.acquire(&node_name, hold).await?;
                if !lease.acquired {
                    debug!(node = %node_name, "lease contended, deferring remediation");
                    if let Some(retry) = lease.requeue_after {
                        fold_requeue(&mut outcome.requeue_after, retry);
                    }
                    return Ok(outcome);
                }

                let template = &steps[step].template;
                let (_, created) = ensure_request(client, check, template, node).await?;
                attempts.push(RemediationAttempt {
                    template: template.clone(),
                    started: now.to_rfc3339(),
                    timed_out: None,
                });
                outcome.created |= created;
                events::emit_event(
                    client,
                    check,
                    EVENT_TYPE_NORMAL,
                    REASON_REMEDIATION_CREATED,
                    &format!(
                        "created {} remediation for node {}",
                        template.remediation_kind(),
                        node_name
                    ),
                )
                .await;

                if let Some(timeout) = steps[step].timeout {
                    fold_requeue(&mut outcome.requeue_after, timeout);
                }
                return Ok(outcome);
            }

            Move::Continue { step, deadline } => {
                let hold = step_hold(steps.get(step), &tunables);
                let lease = lease_manager.acquire(&node_name, hold).await?;
                if !lease.acquired {
                    // Lost the lease mid-attempt; stand back until it frees.
                    warn!(node = %node_name, "lease lost mid-attempt, deferring");
                    if let Some(retry) = lease.requeue_after {
                        fold_requeue(&mut outcome.requeue_after, retry);
                    }
                    return Ok(outcome);
                }

                // The request object may have been deleted out from under
                // us; recreate it under the same attempt, preserving the
                // original start time.
                let template = attempts[attempts.len() - 1].template.clone();
                let request = match current_request {
                    Some(request) => request,
                    None => {
                        info!(node = %node_name, "remediation request vanished, recreating");
                        let (request, created) =
                            ensure_request(client, check, &template, node).await?;
                        outcome.created |= created;
                        request
                    }
                };

                if let Some(deadline) = deadline {
                    if let Ok(remaining) = deadline.signed_duration_since(now).to_std() {
                        fold_requeue(&mut outcome.requeue_after, remaining);
                    }
                }
                if let Some(hint) =
                    check_stale_request(client, &template, &request, now, &tunables).await?
                {
                    fold_requeue(&mut outcome.requeue_after, hint);
                }
                return Ok(outcome);
            }

            Move::TimeOut { step } => {
                let index = attempts.len() - 1;
                let template = attempts[index].template.clone();
                info!(
                    node = %node_name,
                    kind = %template.remediation_kind(),
                    step,
                    "remediation attempt timed out"
                );
                annotate_request(
                    client,
                    &template,
                    &node_name,
                    TIMED_OUT_ANNOTATION,
                    &now.to_rfc3339(),
                )
                .await?;
                attempts[index].timed_out = Some(now.to_rfc3339());
                // Fall through: the next loop iteration begins the next
                // step, or lands in Exhausted.
            }

            Move::Exhausted => {
                // All steps spent. Hold the lease and keep the stale-request
                // timer running on the most recent request.
                let lease = lease_manager
                    .acquire(&node_name, tunables.default_lease_duration)
                    .await?;
                if !lease.acquired {
                    if let Some(retry) = lease.requeue_after {
                        fold_requeue(&mut outcome.requeue_after, retry);
                    }
                    return Ok(outcome);
                }
                if let Some(attempt) = attempts.last() {
                    if let Some(request) =
                        get_request(client, &attempt.template, &node_name).await?
                    {
                        if let Some(hint) = check_stale_request(
                            client,
                            &attempt.template,
                            &request,
                            now,
                            &tunables,
                        )
                        .await?
                        {
                            fold_requeue(&mut outcome.requeue_after, hint);
                        }
                    }
                }
                return Ok(outcome);
            }
        }
    }
}

/// Flag request objects that outlived the stale threshold, exactly once,
/// and keep a timer running until they do.
async fn check_stale_request(
    client: &Client,
    template_ref: &RemediationTemplateRef,
    request: &DynamicObject,
    now: DateTime<Utc>,
    tunables: &Tunables,
) -> Result<Option<Duration>> {
    if request
        .annotations()
        .contains_key(OLD_REMEDIATION_ANNOTATION)
    {
        return Ok(None);
    }

    let Some(created) = request.meta().creation_timestamp.as_ref().map(|t| t.0) else {
        return Ok(None);
    };
    let threshold = chrono::Duration::from_std(tunables.stale_request_threshold)
        .unwrap_or_else(|_| chrono::Duration::max_value());

    if now.signed_duration_since(created) >= threshold {
        let name = request.name_any();
        warn!(
            request = %name,
            "remediation request exceeded the stale threshold without recovery"
        );
        annotate_request(
            client,
            template_ref,
            &name,
            OLD_REMEDIATION_ANNOTATION,
            OLD_REMEDIATION_FLAG,
        )
        .await?;
        #[cfg(feature = "metrics")]
        super::metrics::observe_old_remediation_cr(
            &name,
            request.namespace().as_deref().unwrap_or_default(),
        );
        Ok(None)
    } else {
        let recheck = created + threshold + chrono::Duration::minutes(1) - now;
        Ok(recheck.to_std().ok())
    }
}

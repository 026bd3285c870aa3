//! Node health evaluation.
//!
//! Pure functions over node conditions and the policy's unhealthy clauses.
//! No cluster I/O happens here; the reconciler feeds in the observed state
//! and a single `now` so a whole reconcile shares one clock reading.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::NodeCondition;

use crate::crd::UnhealthyCondition;
use crate::error::Result;

/// Outcome of evaluating one node against a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthOutcome {
    pub healthy: bool,
    /// When a clause matches on (type, status) but its duration has not yet
    /// elapsed: the shortest remaining wait until it would. The reconciler
    /// folds this into its requeue so the flip is observed on time.
    pub next_transition: Option<Duration>,
}

impl HealthOutcome {
    fn healthy_with(next_transition: Option<Duration>) -> Self {
        Self {
            healthy: true,
            next_transition,
        }
    }

    fn unhealthy() -> Self {
        Self {
            healthy: false,
            next_transition: None,
        }
    }
}

/// Evaluate a node's conditions against the policy clauses.
///
/// A clause triggers when the node carries a condition of the clause's type
/// whose status equals the clause's status and whose last transition is at
/// least `duration` ago. A missing condition type simply does not satisfy
/// the clause. A condition without a transition time is treated as having
/// held forever.
pub fn evaluate_node(
    conditions: &[NodeCondition],
    clauses: &[UnhealthyCondition],
    now: DateTime<Utc>,
) -> Result<HealthOutcome> {
    let mut next_transition: Option<Duration> = None;

    for clause in clauses {
        let Some(condition) = conditions.iter().find(|c| c.type_ == clause.type_) else {
            continue;
        };
        if condition.status != clause.status {
            continue;
        }

        let required = chrono::Duration::from_std(clause.duration()?)
            .unwrap_or_else(|_| chrono::Duration::max_value());

        let Some(transition) = condition.last_transition_time.as_ref() else {
            return Ok(HealthOutcome::unhealthy());
        };

        let held = now.signed_duration_since(transition.0);
        if held >= required {
            return Ok(HealthOutcome::unhealthy());
        }

        // Matches on (type, status) but not yet long enough.
        if let Ok(remaining) = (required - held).to_std() {
            next_transition = Some(match next_transition {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
    }

    Ok(HealthOutcome::healthy_with(next_transition))
}

/// Whether a node change warrants reconciling the policies watching it.
///
/// Compares the multiset of `(type, status)` pairs; ordering, timestamps,
/// reasons and messages are ignored.
pub fn conditions_need_reconcile(old: &[NodeCondition], new: &[NodeCondition]) -> bool {
    fn pairs(conditions: &[NodeCondition]) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str()))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    pairs(old) != pairs(new)
}

//! Controller module for NodeHealthCheck reconciliation
//! This module contains the main controller loop, the health evaluator,
//! the escalation engine, the per-node lease manager and the remediation
//! request materialiser.

pub mod conditions;
mod escalation;
#[cfg(test)]
mod escalation_test;
mod events;
pub mod external;
mod health;
mod lease;
#[cfg(test)]
mod lease_test;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
mod remediation;
mod watch;

pub use escalation::{
    escalation_steps, plan, remediate_node, succeeded_false_since, EscalationStep, Move,
    NodeRemediationOutcome,
};
pub use events::{
    REASON_DISABLED, REASON_ENABLED, REASON_REMEDIATION_CREATED, REASON_REMEDIATION_REMOVED,
    REASON_REMEDIATION_SKIPPED,
};
pub use health::{conditions_need_reconcile, evaluate_node, HealthOutcome};
pub use lease::{lease_name, AcquireOutcome, LeaseManager, LEASE_HOLDER_IDENTITY};
pub use reconciler::{
    compute_phase, is_control_plane, pick_control_plane, run_controller, status_merge_patch,
    ControllerState, CONTROLLER,
};
pub use remediation::{
    build_request, check_owner_ref, load_template, owner_ref_matches, validate_template,
    validate_template_constraints, CONTROLLER_NAME, MACHINE_ANNOTATION,
    OLD_REMEDIATION_ANNOTATION, OLD_REMEDIATION_FLAG, PART_OF_LABEL, TIMED_OUT_ANNOTATION,
};
pub use watch::{checks_for_node, selector_matches, NodeConditionsCache};

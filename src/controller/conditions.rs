//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Set while remediation is switched off by a gate (conflicting external
/// checker, missing or invalid template, invalid spec).
pub const CONDITION_TYPE_DISABLED: &str = "Disabled";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Reasons for `Disabled=True`
pub const REASON_CONFLICTING_MHC: &str = "ConflictingMHC";
pub const REASON_TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
pub const REASON_TEMPLATE_INVALID: &str = "TemplateInvalid";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
/// Reason for `Disabled=False`
pub const REASON_ENABLED: &str = "NodeHealthCheckEnabled";

/// Update or add a condition to the conditions list.
///
/// The transition time moves only when the status flips. Returns whether
/// the status flipped, so callers can emit their event exactly once.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let flipped = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if flipped {
            existing.last_transition_time = now;
        }
        flipped
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        true
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        let flipped = set_condition(
            &mut conditions,
            CONDITION_TYPE_DISABLED,
            CONDITION_STATUS_TRUE,
            REASON_CONFLICTING_MHC,
            "an enabled MachineHealthCheck exists",
        );

        assert!(flipped);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_DISABLED);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_DISABLED.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: REASON_TEMPLATE_NOT_FOUND.to_string(),
            message: "template missing".to_string(),
        }];

        let old_time = conditions[0].last_transition_time.clone();
        let flipped = set_condition(
            &mut conditions,
            CONDITION_TYPE_DISABLED,
            CONDITION_STATUS_FALSE,
            REASON_ENABLED,
            "all gates clear",
        );

        assert!(flipped);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_FALSE);
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_same_status_does_not_flip() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_DISABLED.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: REASON_TEMPLATE_NOT_FOUND.to_string(),
            message: "template missing".to_string(),
        }];

        let flipped = set_condition(
            &mut conditions,
            CONDITION_TYPE_DISABLED,
            CONDITION_STATUS_TRUE,
            REASON_TEMPLATE_INVALID,
            "different reason, same status",
        );

        assert!(!flipped);
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, REASON_TEMPLATE_INVALID);
    }

    #[test]
    fn test_is_condition_true() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_DISABLED,
            CONDITION_STATUS_TRUE,
            REASON_INVALID_SPEC,
            "",
        );

        assert!(is_condition_true(&conditions, CONDITION_TYPE_DISABLED));
        assert!(!is_condition_true(&conditions, "Ready"));
    }
}

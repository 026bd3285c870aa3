//! Tests for the escalation engine's planning logic.
//!
//! Covers: step resolution from both template forms, begin/continue/timeout
//! transitions, the progressing hard-timeout, failover indexing, and
//! exhaustion.

#[cfg(test)]
mod tests {
    use super::super::escalation::*;
    use crate::crd::{
        EscalatingRemediation, NodeHealthCheckSpec, RemediationAttempt, RemediationTemplateRef,
        UnhealthyCondition,
    };
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
    use std::time::Duration;

    fn template_ref(kind: &str) -> RemediationTemplateRef {
        RemediationTemplateRef {
            api_version: "remediation.nodehealth.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: "default".to_string(),
            namespace: "remediation".to_string(),
        }
    }

    fn single_template_spec() -> NodeHealthCheckSpec {
        NodeHealthCheckSpec {
            selector: Default::default(),
            unhealthy_conditions: vec![UnhealthyCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                duration: "300s".to_string(),
            }],
            min_healthy: IntOrString::String("51%".to_string()),
            pause_requests: Vec::new(),
            remediation_template: Some(template_ref("SelfNodeRemediationTemplate")),
            escalating_remediations: None,
        }
    }

    fn escalating_spec() -> NodeHealthCheckSpec {
        NodeHealthCheckSpec {
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
            ..single_template_spec()
        }
    }

    fn attempt(template: RemediationTemplateRef, started: DateTime<Utc>) -> RemediationAttempt {
        RemediationAttempt {
            template,
            started: started.to_rfc3339(),
            timed_out: None,
        }
    }

    fn hard_timeout() -> Duration {
        Duration::from_secs(600)
    }

    // ── Step resolution ────────────────────────────────────────────────

    #[test]
    fn test_single_template_is_one_step_without_timeout() {
        let steps = escalation_steps(&single_template_spec()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].template.kind, "SelfNodeRemediationTemplate");
        assert_eq!(steps[0].timeout, None);
    }

    #[test]
    fn test_escalating_steps_sorted_by_order() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].template.kind, "SelfNodeRemediationTemplate");
        assert_eq!(steps[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(steps[1].template.kind, "MachineDeletionRemediationTemplate");
        assert_eq!(steps[1].timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_unparseable_timeout_is_an_error() {
        let mut spec = escalating_spec();
        spec.escalating_remediations.as_mut().unwrap()[0].timeout = "soon".to_string();
        assert!(escalation_steps(&spec).is_err());
    }

    // ── Planning ───────────────────────────────────────────────────────

    #[test]
    fn test_no_attempts_begins_first_step() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let mv = plan(&steps, &[], now, None, hard_timeout()).unwrap();
        assert_eq!(mv, Move::Begin { step: 0 });
    }

    #[test]
    fn test_attempt_within_timeout_continues() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let started = now - ChronoDuration::seconds(2);
        let attempts = vec![attempt(steps[0].template.clone(), started)];

        match plan(&steps, &attempts, now, None, hard_timeout()).unwrap() {
            Move::Continue { step, deadline } => {
                assert_eq!(step, 0);
                let deadline = deadline.unwrap();
                assert_eq!(deadline, started + ChronoDuration::seconds(5));
            }
            other => panic!("expected Continue, got {other:?}"),
        }
    }

    #[test]
    fn test_attempt_past_timeout_times_out() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let attempts = vec![attempt(
            steps[0].template.clone(),
            now - ChronoDuration::seconds(6),
        )];

        assert_eq!(
            plan(&steps, &attempts, now, None, hard_timeout()).unwrap(),
            Move::TimeOut { step: 0 }
        );
    }

    #[test]
    fn test_timeout_boundary_is_inclusive() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let attempts = vec![attempt(
            steps[0].template.clone(),
            now - ChronoDuration::seconds(5),
        )];
        assert_eq!(
            plan(&steps, &attempts, now, None, hard_timeout()).unwrap(),
            Move::TimeOut { step: 0 }
        );
    }

    #[test]
    fn test_timed_out_attempt_begins_next_step() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let mut first = attempt(steps[0].template.clone(), now - ChronoDuration::seconds(10));
        first.timed_out = Some(now.to_rfc3339());

        assert_eq!(
            plan(&steps, &[first], now, None, hard_timeout()).unwrap(),
            Move::Begin { step: 1 }
        );
    }

    #[test]
    fn test_all_steps_timed_out_is_exhausted() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        let mut attempts = vec![
            attempt(steps[0].template.clone(), now - ChronoDuration::seconds(30)),
            attempt(steps[1].template.clone(), now - ChronoDuration::seconds(20)),
        ];
        attempts[0].timed_out = Some((now - ChronoDuration::seconds(25)).to_rfc3339());
        attempts[1].timed_out = Some(now.to_rfc3339());

        assert_eq!(
            plan(&steps, &attempts, now, None, hard_timeout()).unwrap(),
            Move::Exhausted
        );
    }

    #[test]
    fn test_single_template_attempt_never_times_out() {
        let steps = escalation_steps(&single_template_spec()).unwrap();
        let now = Utc::now();
        let attempts = vec![attempt(
            steps[0].template.clone(),
            now - ChronoDuration::days(2),
        )];

        match plan(&steps, &attempts, now, None, hard_timeout()).unwrap() {
            Move::Continue { step: 0, deadline } => assert!(deadline.is_none()),
            other => panic!("expected Continue without deadline, got {other:?}"),
        }
    }

    #[test]
    fn test_succeeded_false_past_hard_timeout_fails_over_early() {
        let steps = escalation_steps(&escalating_spec()).unwrap();
        let now = Utc::now();
        // Step timeout not yet reached, but the remediator has reported
        // Succeeded=False for longer than the hard timeout.
        let attempts = vec![attempt(
            steps[0].template.clone(),
            now - ChronoDuration::seconds(2),
        )];
        let stalled_since = now - ChronoDuration::seconds(601);

        assert_eq!(
            plan(&steps, &attempts, now, Some(stalled_since), hard_timeout()).unwrap(),
            Move::TimeOut { step: 0 }
        );
    }

    #[test]
    fn test_recent_succeeded_false_does_not_fail_over() {
        let steps = escalation_steps(&single_template_spec()).unwrap();
        let now = Utc::now();
        let attempts = vec![attempt(
            steps[0].template.clone(),
            now - ChronoDuration::seconds(30),
        )];
        let stalled_since = now - ChronoDuration::seconds(30);

        assert!(matches!(
            plan(&steps, &attempts, now, Some(stalled_since), hard_timeout()).unwrap(),
            Move::Continue { .. }
        ));
    }

    // ── Request status reading ─────────────────────────────────────────

    fn request_with_conditions(conditions: serde_json::Value) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "remediation.nodehealth.io",
            "v1alpha1",
            "SelfNodeRemediation",
        ));
        let mut request = DynamicObject::new("worker-1", &resource);
        request.data = serde_json::json!({ "status": { "conditions": conditions } });
        request
    }

    #[test]
    fn test_succeeded_false_since_reads_transition_time() {
        let transition = Utc::now() - ChronoDuration::minutes(20);
        let request = request_with_conditions(serde_json::json!([
            { "type": "Ready", "status": "True", "lastTransitionTime": Utc::now().to_rfc3339() },
            { "type": "Succeeded", "status": "False", "lastTransitionTime": transition.to_rfc3339() },
        ]));

        let since = succeeded_false_since(&request).unwrap();
        assert_eq!(since, transition);
    }

    #[test]
    fn test_succeeded_true_is_ignored() {
        let request = request_with_conditions(serde_json::json!([
            { "type": "Succeeded", "status": "True", "lastTransitionTime": Utc::now().to_rfc3339() },
        ]));
        assert!(succeeded_false_since(&request).is_none());
    }

    #[test]
    fn test_missing_status_is_ignored() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "remediation.nodehealth.io",
            "v1alpha1",
            "SelfNodeRemediation",
        ));
        let request = DynamicObject::new("worker-1", &resource);
        assert!(succeeded_false_since(&request).is_none());
    }
}

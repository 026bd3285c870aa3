//! Tests for the lease decision logic.
//!
//! Covers: classification of create/renew/takeover/contended, the expiry
//! boundary, and the persisted duration arithmetic.

#[cfg(test)]
mod tests {
    use super::super::lease::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
    use kube::api::ObjectMeta;
    use std::time::Duration;

    const US: &str = "nodehealth-operator";
    const THEM: &str = "self-node-remediation";

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration_seconds: i32) -> Lease {
        let renewed = Utc::now() - ChronoDuration::seconds(renewed_secs_ago);
        Lease {
            metadata: ObjectMeta {
                name: Some("node-worker-1".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                lease_duration_seconds: Some(duration_seconds),
                acquire_time: Some(MicroTime(renewed)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(1),
                ..Default::default()
            }),
        }
    }

    // ── Classification ─────────────────────────────────────────────────

    #[test]
    fn test_no_lease_creates() {
        assert_eq!(classify(None, US, Utc::now()), LeaseDisposition::Create);
    }

    #[test]
    fn test_own_lease_renews() {
        let lease = lease(Some(US), 10, 60);
        assert_eq!(
            classify(Some(&lease), US, Utc::now()),
            LeaseDisposition::Renew
        );
    }

    #[test]
    fn test_foreign_unexpired_lease_is_contended() {
        let lease = lease(Some(THEM), 10, 60);
        assert_eq!(
            classify(Some(&lease), US, Utc::now()),
            LeaseDisposition::Contended
        );
    }

    #[test]
    fn test_foreign_expired_lease_is_taken_over() {
        let lease = lease(Some(THEM), 120, 60);
        assert_eq!(
            classify(Some(&lease), US, Utc::now()),
            LeaseDisposition::TakeOver
        );
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        // now - renewTime == leaseDurationSeconds: expired.
        let now = Utc::now();
        let mut at_boundary = lease(Some(THEM), 0, 60);
        at_boundary.spec.as_mut().unwrap().renew_time =
            Some(MicroTime(now - ChronoDuration::seconds(60)));
        assert_eq!(
            classify(Some(&at_boundary), US, now),
            LeaseDisposition::TakeOver
        );

        let mut just_inside = lease(Some(THEM), 0, 60);
        just_inside.spec.as_mut().unwrap().renew_time =
            Some(MicroTime(now - ChronoDuration::seconds(59)));
        assert_eq!(
            classify(Some(&just_inside), US, now),
            LeaseDisposition::Contended
        );
    }

    #[test]
    fn test_lease_without_holder_is_taken_over() {
        let lease = lease(None, 10, 60);
        assert_eq!(
            classify(Some(&lease), US, Utc::now()),
            LeaseDisposition::TakeOver
        );
    }

    #[test]
    fn test_lease_without_spec_is_taken_over() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert_eq!(
            classify(Some(&lease), US, Utc::now()),
            LeaseDisposition::TakeOver
        );
    }

    #[test]
    fn test_lease_without_renew_time_falls_back_to_acquire_time() {
        let now = Utc::now();
        let mut lease = lease(Some(THEM), 0, 60);
        {
            let spec = lease.spec.as_mut().unwrap();
            spec.renew_time = None;
            spec.acquire_time = Some(MicroTime(now - ChronoDuration::seconds(10)));
        }
        assert_eq!(classify(Some(&lease), US, now), LeaseDisposition::Contended);
    }

    // ── Release ownership ──────────────────────────────────────────────

    #[test]
    fn test_release_requires_holding_the_lease() {
        let ours = lease(Some(US), 10, 60);
        assert!(is_held_by(Some(&ours), US));
    }

    #[test]
    fn test_foreign_holder_release_is_a_no_op() {
        let theirs = lease(Some(THEM), 10, 60);
        assert!(!is_held_by(Some(&theirs), US));
    }

    #[test]
    fn test_absent_lease_release_is_a_no_op() {
        assert!(!is_held_by(None, US));
    }

    #[test]
    fn test_lease_without_holder_is_not_released() {
        let unheld = lease(None, 10, 60);
        assert!(!is_held_by(Some(&unheld), US));
    }

    // ── Duration arithmetic ────────────────────────────────────────────

    #[test]
    fn test_duration_is_ceil_plus_buffer() {
        let buffer = Duration::from_secs(30);
        assert_eq!(
            lease_duration_seconds(Duration::from_secs(300), buffer),
            330
        );
        // Sub-second holds round up before the buffer is added.
        assert_eq!(
            lease_duration_seconds(Duration::from_millis(1500), buffer),
            32
        );
        assert_eq!(lease_duration_seconds(Duration::ZERO, buffer), 30);
    }

    // ── Naming ─────────────────────────────────────────────────────────

    #[test]
    fn test_lease_name_is_deterministic() {
        assert_eq!(lease_name("worker-1"), "node-worker-1");
        assert_eq!(lease_name("worker-1"), lease_name("worker-1"));
    }
}

//! Kubernetes Event emission.
//!
//! Events are single-shot idempotent writes: a failure to record one is
//! logged and left for the next reconcile, never propagated.

use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::crd::NodeHealthCheck;

/// Namespace cluster-scoped objects report their events into.
const EVENTS_NAMESPACE: &str = "default";

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

pub const REASON_REMEDIATION_CREATED: &str = "RemediationCreated";
pub const REASON_REMEDIATION_SKIPPED: &str = "RemediationSkipped";
pub const REASON_REMEDIATION_REMOVED: &str = "RemediationRemoved";
pub const REASON_DISABLED: &str = "Disabled";
pub const REASON_ENABLED: &str = "Enabled";

/// Record an event against the NodeHealthCheck. Best effort.
pub async fn emit_event(
    client: &Client,
    check: &NodeHealthCheck,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    let events: Api<Event> = Api::namespaced(client.clone(), EVENTS_NAMESPACE);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", check.name_any())),
            namespace: Some(EVENTS_NAMESPACE.to_string()),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: check.object_ref(&()),
        reporting_component: Some("nodehealth-operator".to_string()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!(
            check = %check.name_any(),
            reason,
            "failed to record event: {e}"
        );
    }
}

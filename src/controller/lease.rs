//! Per-node coordination leases.
//!
//! A `coordination.k8s.io/v1` Lease per node arbitrates who may drive
//! remediation of that node: this controller, another instance of it, or an
//! external remediator. Whoever holds the unexpired lease wins; everyone
//! else requeues. Expiry is judged from `renewTime + leaseDurationSeconds`,
//! all of which are persisted so external actors can apply the same rule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::config;
use crate::error::{Error, Result};

/// Stable holder identity for this controller. Takeover between controller
/// instances happens by expiry, never by identity mismatch.
pub const LEASE_HOLDER_IDENTITY: &str = "nodehealth-operator";

const FIELD_MANAGER: &str = "nodehealth-operator";

/// Deterministic lease name for a node.
pub fn lease_name(node_name: &str) -> String {
    format!("node-{node_name}")
}

/// Result of an acquire call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireOutcome {
    pub acquired: bool,
    /// How long the hold is guaranteed when acquired.
    pub hold_remaining: Option<Duration>,
    /// When contended: how long to wait before trying again.
    pub requeue_after: Option<Duration>,
}

/// What to do with an existing (or absent) lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LeaseDisposition {
    Create,
    Renew,
    TakeOver,
    Contended,
}

/// Classify a lease against a prospective holder at `now`.
pub(crate) fn classify(existing: Option<&Lease>, holder: &str, now: DateTime<Utc>) -> LeaseDisposition {
    let Some(lease) = existing else {
        return LeaseDisposition::Create;
    };
    let Some(spec) = lease.spec.as_ref() else {
        return LeaseDisposition::TakeOver;
    };

    match spec.holder_identity.as_deref() {
        Some(current) if current == holder => LeaseDisposition::Renew,
        Some(_) => {
            if lease_expired(spec, now) {
                LeaseDisposition::TakeOver
            } else {
                LeaseDisposition::Contended
            }
        }
        None => LeaseDisposition::TakeOver,
    }
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(duration_seconds) = spec.lease_duration_seconds else {
        return true;
    };
    let reference = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match reference {
        Some(renewed) => {
            now.signed_duration_since(renewed) >= chrono::Duration::seconds(duration_seconds as i64)
        }
        None => true,
    }
}

/// Whether the lease exists and `holder` currently holds it. Gates
/// `release`: anything else (absent lease, foreign or empty holder) makes
/// release a no-op.
pub(crate) fn is_held_by(existing: Option<&Lease>, holder: &str) -> bool {
    existing
        .and_then(|lease| lease.spec.as_ref())
        .and_then(|spec| spec.holder_identity.as_deref())
        .map(|current| current == holder)
        .unwrap_or(false)
}

/// `ceil(hold) + safety buffer`, as written to `leaseDurationSeconds`.
pub(crate) fn lease_duration_seconds(hold: Duration, buffer: Duration) -> i32 {
    let mut seconds = hold.as_secs();
    if hold.subsec_nanos() > 0 {
        seconds += 1;
    }
    (seconds + buffer.as_secs()) as i32
}

/// Acquires, renews and releases per-node leases.
#[derive(Clone)]
pub struct LeaseManager {
    client: Client,
    namespace: String,
    holder: String,
}

impl LeaseManager {
    pub fn new(client: Client, namespace: String) -> Self {
        Self {
            client,
            namespace,
            holder: LEASE_HOLDER_IDENTITY.to_string(),
        }
    }

    /// Manager with an explicit holder identity; used for the process-level
    /// leader lease, whose holder is the pod hostname.
    pub fn with_holder(client: Client, namespace: String, holder: String) -> Self {
        Self {
            client,
            namespace,
            holder,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Acquire or renew the node's lease for `hold`.
    ///
    /// Returns `acquired=false` with a retry hint while someone else holds
    /// an unexpired lease.
    pub async fn acquire(&self, node_name: &str, hold: Duration) -> Result<AcquireOutcome> {
        self.acquire_named(&lease_name(node_name), hold).await
    }

    /// Acquire or renew a lease by its literal name.
    pub async fn acquire_named(&self, name: &str, hold: Duration) -> Result<AcquireOutcome> {
        let tunables = config::tunables();
        let api = self.api();
        let now = Utc::now();

        let existing = api.get_opt(name).await?;
        let duration_seconds = lease_duration_seconds(hold, tunables.lease_safety_buffer);

        match classify(existing.as_ref(), &self.holder, now) {
            LeaseDisposition::Create => {
                let lease = self.new_lease(name, now, duration_seconds, 1);
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(lease = name, "acquired lease");
                        Ok(acquired(hold))
                    }
                    // Lost the create race; the next reconcile re-evaluates.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        debug!(lease = name, "lease create raced, requeueing");
                        Ok(contended(tunables.lease_retry_interval))
                    }
                    Err(e) => Err(Error::KubeError(e)),
                }
            }
            LeaseDisposition::Renew => {
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": self.holder,
                        "leaseDurationSeconds": duration_seconds,
                        "renewTime": MicroTime(now),
                    }
                });
                api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                Ok(acquired(hold))
            }
            LeaseDisposition::TakeOver => {
                let transitions = existing
                    .as_ref()
                    .and_then(|l| l.spec.as_ref())
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0)
                    + 1;
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": self.holder,
                        "leaseDurationSeconds": duration_seconds,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseTransitions": transitions,
                    }
                });
                api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                info!(lease = name, "took over expired lease");
                Ok(acquired(hold))
            }
            LeaseDisposition::Contended => {
                debug!(lease = name, "lease held by another actor");
                Ok(contended(tunables.lease_retry_interval))
            }
        }
    }

    /// Delete the node's lease iff we hold it; a foreign holder is left
    /// untouched.
    pub async fn release(&self, node_name: &str) -> Result<()> {
        let api = self.api();
        let name = lease_name(node_name);

        let existing = api.get_opt(&name).await?;
        if existing.is_none() {
            return Ok(());
        }
        if !is_held_by(existing.as_ref(), &self.holder) {
            debug!(node = node_name, "not releasing lease held by another actor");
            return Ok(());
        }

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = node_name, "released lease");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    fn new_lease(
        &self,
        name: &str,
        now: DateTime<Utc>,
        duration_seconds: i32,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(duration_seconds),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

fn acquired(hold: Duration) -> AcquireOutcome {
    AcquireOutcome {
        acquired: true,
        hold_remaining: Some(hold),
        requeue_after: None,
    }
}

fn contended(retry: Duration) -> AcquireOutcome {
    AcquireOutcome {
        acquired: false,
        hold_remaining: None,
        requeue_after: Some(retry),
    }
}

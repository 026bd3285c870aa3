//! Process-wide tunables.
//!
//! All intervals the controller schedules against live here. They are set
//! once at startup (flags in `main.rs`) and read everywhere else through
//! [`tunables`]. Tests swap them through [`override_tunables`], which
//! restores the previous values when the guard drops.

use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;

/// Namespace holding the per-node coordination leases.
pub const DEFAULT_LEASES_NAMESPACE: &str = "nodehealth-leases";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunables {
    /// Requeue interval while another holder owns a node lease.
    pub lease_retry_interval: Duration,
    /// Lease hold when no escalation timeout applies (single-template form).
    pub default_lease_duration: Duration,
    /// Slack added on top of the requested hold when writing
    /// `leaseDurationSeconds`.
    pub lease_safety_buffer: Duration,
    /// Namespace the per-node leases are created in.
    pub leases_namespace: String,
    /// Age at which an unresolved remediation CR is flagged and counted.
    pub stale_request_threshold: Duration,
    /// Requeue interval while the cluster is upgrading.
    pub upgrade_requeue_interval: Duration,
    /// Periodic full resync; bounds detection latency for condition
    /// durations that elapse without a node event.
    pub resync_period: Duration,
    /// How long a remediation CR may report `Succeeded=False` before the
    /// attempt is failed over early.
    pub progressing_hard_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            lease_retry_interval: Duration::from_secs(30),
            default_lease_duration: Duration::from_secs(600),
            lease_safety_buffer: Duration::from_secs(30),
            leases_namespace: DEFAULT_LEASES_NAMESPACE.to_string(),
            stale_request_threshold: Duration::from_secs(48 * 3600),
            upgrade_requeue_interval: Duration::from_secs(60),
            resync_period: Duration::from_secs(60),
            progressing_hard_timeout: Duration::from_secs(600),
        }
    }
}

static TUNABLES: Lazy<RwLock<Tunables>> = Lazy::new(|| RwLock::new(Tunables::default()));

/// Current tunables snapshot.
pub fn tunables() -> Tunables {
    match TUNABLES.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Replace the tunables at startup. Call before the controller starts.
pub fn set_tunables(new: Tunables) {
    match TUNABLES.write() {
        Ok(mut guard) => *guard = new,
        Err(poisoned) => *poisoned.into_inner() = new,
    }
}

/// Guard returned by [`override_tunables`]; restores the previous tunables
/// on drop.
pub struct TunablesGuard {
    previous: Option<Tunables>,
}

impl Drop for TunablesGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            set_tunables(previous);
        }
    }
}

/// Swap the tunables for the lifetime of the returned guard.
pub fn override_tunables(new: Tunables) -> TunablesGuard {
    let previous = tunables();
    set_tunables(new);
    TunablesGuard {
        previous: Some(previous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_restores_on_drop() {
        let base = tunables();
        {
            let _guard = override_tunables(Tunables {
                lease_retry_interval: Duration::from_secs(1),
                ..base.clone()
            });
            assert_eq!(tunables().lease_retry_interval, Duration::from_secs(1));
        }
        assert_eq!(tunables().lease_retry_interval, base.lease_retry_interval);
    }

    #[test]
    fn test_defaults() {
        let t = Tunables::default();
        assert_eq!(t.stale_request_threshold, Duration::from_secs(48 * 3600));
        assert_eq!(t.leases_namespace, DEFAULT_LEASES_NAMESPACE);
    }
}

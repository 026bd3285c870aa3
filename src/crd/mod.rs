//! Custom Resource Definitions for the NodeHealthCheck operator.

mod node_health_check;
pub mod types;

pub use node_health_check::{
    percent_value, resolve_min_healthy, NodeHealthCheck, NodeHealthCheckSpec,
    NodeHealthCheckStatus,
};
pub use types::*;

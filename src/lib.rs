//! NodeHealth-K8s: node-health-based remediation operator for Kubernetes
//!
//! This crate watches a set of cluster nodes against declarative
//! NodeHealthCheck policies and, when a node is deemed unhealthy, requests
//! remediation by materialising a remediation CR from a user-supplied
//! template. External remediators watch those CRs and act on them.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};

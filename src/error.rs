//! Error types for the NodeHealthCheck operator.

use thiserror::Error;

/// All errors surfaced by the controller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The referenced remediation template object does not exist.
    #[error("remediation template {namespace}/{name} ({kind}) not found")]
    TemplateNotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// The template object exists but has no `spec.template` payload.
    #[error("remediation template {namespace}/{name} has no spec.template")]
    TemplateMalformed { name: String, namespace: String },

    /// The template reference violates a platform constraint.
    #[error("remediation template invalid: {0}")]
    TemplateInvalid(String),

    #[error("invalid NodeHealthCheck spec: {0}")]
    ValidationError(String),

    #[error("invalid duration {value:?}: {source}")]
    DurationParse {
        value: String,
        source: parse_duration::parse::Error,
    },

    #[error("invalid timestamp {value:?}: {source}")]
    TimestampParse {
        value: String,
        source: chrono::ParseError,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether the framework should retry soon (transient cluster-side
    /// failures) or fall back to the slow requeue.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => {
                // Conflicts and server-side throttling converge on retry.
                ae.code == 409 || ae.code == 429 || ae.code >= 500
            }
            Error::KubeError(_) => true,
            Error::TemplateNotFound { .. }
            | Error::TemplateMalformed { .. }
            | Error::TemplateInvalid(_)
            | Error::ValidationError(_)
            | Error::DurationParse { .. }
            | Error::TimestampParse { .. }
            | Error::SerializationError(_)
            | Error::ConfigError(_) => false,
        }
    }

    /// Stable label value for the reconcile error counter.
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::TemplateNotFound { .. } => "template_not_found",
            Error::TemplateMalformed { .. } => "template_malformed",
            Error::TemplateInvalid(_) => "template_invalid",
            Error::ValidationError(_) => "validation",
            Error::DurationParse { .. } | Error::TimestampParse { .. } => "parse",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_conflict_is_retriable() {
        assert!(api_error(409).is_retriable());
        assert!(api_error(500).is_retriable());
        assert!(api_error(429).is_retriable());
    }

    #[test]
    fn test_not_found_is_not_retriable() {
        assert!(!api_error(404).is_retriable());
    }

    #[test]
    fn test_policy_scoped_errors_are_terminal() {
        let err = Error::TemplateNotFound {
            kind: "SelfNodeRemediationTemplate".to_string(),
            name: "default".to_string(),
            namespace: "remediation".to_string(),
        };
        assert!(!err.is_retriable());
        assert_eq!(err.metric_kind(), "template_not_found");
    }
}

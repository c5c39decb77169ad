//! Error types for the rollout executor.
//!
//! An unstable or cancelled rollout is not an error: those are terminal
//! states reported through [`crate::monitor::RolloutState`] and
//! [`crate::executor::DeployOutcome`].

use thiserror::Error;

/// Errors that can abort a rollout or one of its cluster operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing role configuration, inconsistent roles, unresolved
    /// builds. Shown to the operator verbatim.
    #[error("{0}")]
    User(String),

    /// Connection-level failure talking to a cluster. Retried by
    /// [`crate::kubernetes::RetryingCluster`] before surfacing.
    #[error("Cluster connection failed during {operation}: {message}")]
    ClusterTransient { operation: String, message: String },

    /// Any other Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration or deploy plan
    #[error("Configuration error: {0}")]
    Config(String),

    /// Release persistence failure
    #[error("Release store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    /// Whether a retry of the same call has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ClusterTransient { .. })
    }

    /// Classify a kube error, turning connection failures into
    /// [`Error::ClusterTransient`].
    pub fn from_kube(operation: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => {
                Self::ClusterTransient {
                    operation: operation.to_string(),
                    message: err.to_string(),
                }
            }
            other => Self::Kube(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_is_verbatim() {
        let err = Error::user("Missing role config for app-server in deploy group pod1");
        assert_eq!(
            err.to_string(),
            "Missing role config for app-server in deploy group pod1"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_read_events_failure_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::from_kube("list pods", kube::Error::ReadEvents(io));
        assert!(err.is_transient());
        assert!(err.to_string().contains("list pods"));
    }

    #[test]
    fn test_api_error_is_not_transient() {
        let api = kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        };
        let err = Error::from_kube("list pods", kube::Error::Api(api));
        assert!(!err.is_transient());
        assert!(matches!(err, Error::Kube(_)));
    }
}

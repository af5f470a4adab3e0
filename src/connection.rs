use thiserror::Error;
use tracing::error;

use crate::domain::{ProjectReference, PullRequest, Repository, RetrievalStatus};

/// Remote calls the monitor needs from the hosting service.
pub trait ServerConnection: Send + Sync {
    fn list_projects(&self) -> Result<Vec<ProjectReference>, ConnectionError>;

    fn list_repositories(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<Repository>, ConnectionError>;

    /// Pull requests that are currently open. The result supersedes any
    /// earlier snapshot.
    fn list_active_pull_requests(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError>;

    fn list_completed_pull_requests(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError>;

    /// Called whenever a pull request is replaced or dropped from a live
    /// collection.
    fn release_pull_request(&self, _pull_request: &PullRequest) {}
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Server could not be reached: {0}")]
    Unreachable(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Server rejected the credentials")]
    Unauthorized,
    #[error("Access to the resource is forbidden")]
    Forbidden,
    #[error("Server responded with HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Failed to decode the server response: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
    #[error("{} errors occurred", .0.len())]
    Multiple(Vec<ConnectionError>),
}

impl ConnectionError {
    fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unreachable(_) | ConnectionError::Timeout(_)
        )
    }

    fn is_authorisation(&self) -> bool {
        matches!(
            self,
            ConnectionError::Unauthorized | ConnectionError::Forbidden
        )
    }

    /// Leaf errors, with nested composites expanded.
    pub fn flatten(&self) -> Vec<&ConnectionError> {
        match self {
            ConnectionError::Multiple(inner) => inner.iter().flat_map(Self::flatten).collect(),
            leaf => vec![leaf],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Auth,
    Unknown,
}

impl FailureKind {
    /// Connection problems win over auth problems, which win over anything
    /// else. Returns `None` when there is nothing to classify.
    pub fn classify(errors: &[ConnectionError]) -> Option<Self> {
        let leaves: Vec<&ConnectionError> = errors.iter().flat_map(|e| e.flatten()).collect();
        if leaves.iter().any(|e| e.is_connectivity()) {
            Some(FailureKind::Connection)
        } else if leaves.iter().any(|e| e.is_authorisation()) {
            Some(FailureKind::Auth)
        } else if !errors.is_empty() {
            Some(FailureKind::Unknown)
        } else {
            None
        }
    }

    pub fn status(self) -> RetrievalStatus {
        match self {
            FailureKind::Connection => RetrievalStatus::FailedDueToConnection,
            FailureKind::Auth => RetrievalStatus::FailedDueToAuth,
            FailureKind::Unknown => RetrievalStatus::FailedReasonUnknown,
        }
    }
}

/// Logs each unexpected error on its own line.
pub(crate) fn log_unrecognised(errors: &[ConnectionError]) {
    for (i, err) in errors.iter().flat_map(|e| e.flatten()).enumerate() {
        error!(index = i, error = %err, detail = ?err, "update exception");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn could_not_reach_server() -> Vec<ConnectionError> {
        vec![
            ConnectionError::Unreachable("dns".into()),
            ConnectionError::Multiple(vec![ConnectionError::Timeout("send".into())]),
            ConnectionError::Multiple(vec![
                ConnectionError::Unauthorized,
                ConnectionError::Unreachable("refused".into()),
            ]),
        ]
    }

    fn unauthorised() -> Vec<ConnectionError> {
        vec![
            ConnectionError::Unauthorized,
            ConnectionError::Multiple(vec![ConnectionError::Unauthorized]),
            ConnectionError::Forbidden,
            ConnectionError::Multiple(vec![ConnectionError::Forbidden]),
        ]
    }

    fn unrecognised() -> Vec<ConnectionError> {
        vec![
            ConnectionError::Other("boom".into()),
            ConnectionError::Multiple(vec![ConnectionError::Decode("eof".into())]),
            ConnectionError::Status {
                status: 500,
                message: "oops".into(),
            },
        ]
    }

    #[test]
    fn classify_each_example_individually() {
        for err in could_not_reach_server() {
            assert_eq!(FailureKind::classify(&[err]), Some(FailureKind::Connection));
        }
        for err in unauthorised() {
            assert_eq!(FailureKind::classify(&[err]), Some(FailureKind::Auth));
        }
        for err in unrecognised() {
            assert_eq!(FailureKind::classify(&[err]), Some(FailureKind::Unknown));
        }
    }

    #[test]
    fn connection_takes_precedence_over_auth_and_unknown() {
        let errors = vec![
            ConnectionError::Other("boom".into()),
            ConnectionError::Unauthorized,
            ConnectionError::Timeout("slow".into()),
        ];
        assert_eq!(FailureKind::classify(&errors), Some(FailureKind::Connection));
    }

    #[test]
    fn auth_takes_precedence_over_unknown() {
        let errors = vec![ConnectionError::Other("boom".into()), ConnectionError::Forbidden];
        assert_eq!(FailureKind::classify(&errors), Some(FailureKind::Auth));
    }

    #[test]
    fn no_errors_means_no_failure() {
        assert_eq!(FailureKind::classify(&[]), None);
    }

    #[test]
    fn flatten_expands_nested_composites() {
        let err = ConnectionError::Multiple(vec![
            ConnectionError::Forbidden,
            ConnectionError::Multiple(vec![ConnectionError::Unauthorized]),
        ]);
        assert_eq!(err.flatten().len(), 2);
    }
}

//! Engine-wide error type.

use overlay_orch_common::TaskError;
use overlay_types::{IpPrefix, SwitchId};
use thiserror::Error;

use crate::southbound::SouthboundError;

#[derive(Debug, Clone, Error)]
pub enum FibError {
    #[error("Routing store error: {0}")]
    Store(String),
    #[error("Flow programming failed: {0}")]
    Backend(String),
    /// The backend kept rejecting a batch through every in-place retry.
    #[error("Flow commit abandoned after {attempts} attempts: {message}")]
    CommitFailed { attempts: u32, message: String },
    #[error("ID allocation from pool {pool} failed: {message}")]
    IdAllocation { pool: String, message: String },
    #[error("Egress resolution failed: {0}")]
    Egress(String),
    #[error("Invalid route entry {prefix}: {reason}")]
    InvalidEntry { prefix: String, reason: String },
    #[error("ECMP constraint violated for {prefix}: {paths} route paths, at most {max} supported")]
    EcmpConstraint {
        prefix: IpPrefix,
        paths: usize,
        max: usize,
    },
    #[error("VPN instance not found: {0}")]
    VpnNotFound(String),
    #[error("No adjacency for {prefix} on switch {switch}")]
    Unresolvable { switch: SwitchId, prefix: IpPrefix },
}

impl FibError {
    pub fn invalid_entry(prefix: impl ToString, reason: impl Into<String>) -> Self {
        FibError::InvalidEntry {
            prefix: prefix.to_string(),
            reason: reason.into(),
        }
    }

    /// Soft failures degrade a route to "not yet forwarding" and are never
    /// retried by the job queue; reconciliation re-drives them.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            FibError::VpnNotFound(_) | FibError::Unresolvable { .. }
        )
    }
}

impl From<SouthboundError> for FibError {
    fn from(err: SouthboundError) -> Self {
        match err {
            SouthboundError::Store(message) => FibError::Store(message),
            SouthboundError::Backend(message) => FibError::Backend(message),
            SouthboundError::IdPool { pool, message } => FibError::IdAllocation { pool, message },
            SouthboundError::Egress(message) => FibError::Egress(message),
        }
    }
}

impl From<FibError> for TaskError {
    fn from(err: FibError) -> Self {
        match err {
            FibError::Store(_)
            | FibError::Backend(_)
            | FibError::IdAllocation { .. }
            | FibError::Egress(_) => TaskError::backend(err.to_string()),
            FibError::InvalidEntry { .. } | FibError::EcmpConstraint { .. } => {
                TaskError::invalid_entry(err.to_string())
            }
            FibError::CommitFailed { .. } => TaskError::internal(err.to_string()),
            FibError::VpnNotFound(_) => TaskError::ignored(err.to_string()),
            FibError::Unresolvable { .. } => TaskError::waiting_for(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FibError>;

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_orch_common::TaskStatus;

    #[test]
    fn test_soft_classification() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(FibError::VpnNotFound("rd1".into()).is_soft());
        assert!(FibError::Unresolvable {
            switch: SwitchId::new(3),
            prefix
        }
        .is_soft());
        assert!(!FibError::Backend("rejected".into()).is_soft());
        assert!(!FibError::EcmpConstraint {
            prefix,
            paths: 3,
            max: 2
        }
        .is_soft());
    }

    #[test]
    fn test_task_error_mapping() {
        let retry: TaskError = FibError::Store("timeout".into()).into();
        assert!(retry.is_retryable());

        let invalid: TaskError = FibError::invalid_entry("bogus", "unparseable prefix").into();
        assert_eq!(invalid.to_status(), TaskStatus::InvalidEntry);

        let gone: TaskError = FibError::VpnNotFound("rd9".into()).into();
        assert_eq!(gone.to_status(), TaskStatus::Ignore);

        let abandoned: TaskError = FibError::CommitFailed {
            attempts: 4,
            message: "rejected".into(),
        }
        .into();
        assert!(!abandoned.is_retryable());
    }

    #[test]
    fn test_southbound_conversion() {
        let err: FibError = SouthboundError::IdPool {
            pool: "labels".into(),
            message: "exhausted".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "ID allocation from pool labels failed: exhausted"
        );
    }
}

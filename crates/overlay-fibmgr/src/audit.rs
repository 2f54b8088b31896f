//! Structured audit trail for forwarding state changes.
//!
//! Every allocation or teardown of a shared forwarding resource (labels,
//! next-hop groups, leaked inter-VPN entries) and every bulk reconciliation
//! produces one [`AuditRecord`]. Records are serialized as JSON and emitted
//! on the `audit` tracing target by [`audit_log!`](crate::audit_log), at a
//! level that follows the outcome:
//!
//! | Outcome | Level |
//! |---------|-------|
//! | success | info |
//! | in progress | debug |
//! | failure, denied | warn |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Label, group or shadow entry created
    ResourceCreate,
    /// Reference added to or dropped from a shared resource
    ResourceModify,
    /// Label, group or shadow entry removed
    ResourceDelete,
    /// Route leaked between two linked VPNs
    RouteLeak,
    /// Bulk replay or cleanup for a switch or tunnel
    Reconciliation,
    /// Daemon start and stop
    SystemLifecycle,
    ConfigurationChange,
    ErrorCondition,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditCategory::ResourceCreate => "RESOURCE_CREATE",
            AuditCategory::ResourceModify => "RESOURCE_MODIFY",
            AuditCategory::ResourceDelete => "RESOURCE_DELETE",
            AuditCategory::RouteLeak => "ROUTE_LEAK",
            AuditCategory::Reconciliation => "RECONCILIATION",
            AuditCategory::SystemLifecycle => "SYSTEM_LIFECYCLE",
            AuditCategory::ConfigurationChange => "CONFIGURATION_CHANGE",
            AuditCategory::ErrorCondition => "ERROR_CONDITION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audited event. Built with the `with_*` methods, then logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that produced the event, e.g. `NextHopGroupBuilder`.
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Label value, group id, `rd/prefix` and the like.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Starts a record stamped with the current time. The outcome stays
    /// `InProgress` until set.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Records the failure reason and marks the outcome as `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target.
///
/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "LabelManager", "register_label")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id("100"));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure | $crate::audit::AuditOutcome::Denied => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Installs a JSON tracing subscriber. `log` records are bridged into it.
pub fn init_json_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_builder() {
        let record = AuditRecord::new(
            AuditCategory::ResourceCreate,
            "NextHopGroupBuilder",
            "create_single_group",
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id("150001")
        .with_object_type("next_hop_group");

        assert_eq!(record.category, AuditCategory::ResourceCreate);
        assert_eq!(record.source, "NextHopGroupBuilder");
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_id.as_deref(), Some("150001"));
        assert_eq!(record.object_type.as_deref(), Some("next_hop_group"));
    }

    #[test]
    fn test_with_error_marks_failure() {
        let record = AuditRecord::new(AuditCategory::RouteLeak, "InterVpnLinkRouter", "leak")
            .with_error("label pool exhausted");
        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("label pool exhausted"));
    }

    #[test]
    fn test_json_contains_fields() {
        let json = AuditRecord::new(AuditCategory::Reconciliation, "RouteReconciler", "switch_join")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "switch": 7, "routes": 12 }))
            .to_json();

        assert!(json.contains("RECONCILIATION"));
        assert!(json.contains("\"outcome\":\"success\""));
        assert!(json.contains("\"routes\":12"));
        assert!(!json.contains("object_id"));
    }

    #[test]
    fn test_display() {
        assert_eq!(AuditCategory::RouteLeak.to_string(), "ROUTE_LEAK");
        assert_eq!(AuditOutcome::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_macro_accepts_all_outcomes() {
        for outcome in [
            AuditOutcome::Success,
            AuditOutcome::InProgress,
            AuditOutcome::Failure,
            AuditOutcome::Denied,
        ] {
            crate::audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "test", "noop")
                .with_outcome(outcome));
        }
    }
}

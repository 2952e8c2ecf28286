//! Error taxonomy shared by every reconciler.
//!
//! Idempotent creates absorb `AlreadyExists` and lenient deletes absorb
//! absence before anything reaches this type. `Pending` is only surfaced once
//! the local retry budget is spent; every other kind propagates unmodified.

use thiserror::Error;

use crate::client::ClientError;

/// Resource kinds, used as error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Gateway,
    NatRule,
    Pool,
    ServiceEngineGroup,
    VirtualService,
    Record,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Gateway => "gateway",
            ResourceKind::NatRule => "NAT rule",
            ResourceKind::Pool => "load balancer pool",
            ResourceKind::ServiceEngineGroup => "service engine group",
            ResourceKind::VirtualService => "virtual service",
            ResourceKind::Record => "shared record",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("virtual service '{name}' still pending after {attempts} attempt(s): {message}")]
    Pending {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("invalid subnet '{subnet}': {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("no free address left in {range}")]
    ExhaustedRange { range: String },

    #[error("version token for record '{record}' is stale")]
    PreconditionFailed { record: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{kind} '{name}' conflicts with requested state: {reason}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    #[error("backend error: {0}")]
    Backend(#[from] ClientError),
}

impl GatewayError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        GatewayError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether repeating the same call may succeed without outside action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Pending { .. } | GatewayError::PreconditionFailed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let pending = GatewayError::Pending {
            name: "vs".into(),
            attempts: 5,
            message: "busy".into(),
        };
        assert!(pending.is_retryable());
        assert!(GatewayError::PreconditionFailed {
            record: "r".into()
        }
        .is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::not_found(ResourceKind::Pool, "p").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = GatewayError::not_found(ResourceKind::NatRule, "dnat-web");
        assert_eq!(err.to_string(), "NAT rule 'dnat-web' not found");

        let err: GatewayError = ClientError::Http("connection reset".into()).into();
        assert!(err.to_string().contains("connection reset"));
    }
}

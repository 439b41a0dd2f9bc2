use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use udrv_sidechannel::ChannelError;
use udrv_verbs::{QpState, QueryId, VerbsError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

/// The device resources a binding owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    ProtectionDomain,
    MemoryRegion,
    SendCq,
    RecvCq,
    SendBuffer,
    RecvBuffer,
    QueuePair,
    AddressHandle,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ProtectionDomain => "protection domain",
            ResourceKind::MemoryRegion => "memory region",
            ResourceKind::SendCq => "send CQ",
            ResourceKind::RecvCq => "receive CQ",
            ResourceKind::SendBuffer => "send buffer",
            ResourceKind::RecvBuffer => "receive buffer",
            ResourceKind::QueuePair => "queue pair",
            ResourceKind::AddressHandle => "address handle",
        };
        f.write_str(name)
    }
}

/// Why a path resolution did not produce an address handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("a path query is already in flight")]
    AlreadyInFlight,

    #[error("path query submission failed: {0}")]
    Submit(#[source] VerbsError),

    #[error("path query completed with status {status}")]
    Failed { status: i32 },

    #[error("address handle creation failed: {0}")]
    AddressHandle(#[source] VerbsError),

    #[error("completion for unknown path query {0:?}")]
    UnknownQuery(QueryId),
}

/// Failures that abort the handshake of a device binding.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("device query failed: {0}")]
    Query(#[source] VerbsError),

    #[error("{resource} allocation failed: {source}")]
    Allocation {
        resource: ResourceKind,
        #[source]
        source: VerbsError,
    },

    #[error("QP transition to {target} failed: {source}")]
    Transition {
        target: QpState,
        #[source]
        source: VerbsError,
    },

    #[error("side channel: {0}")]
    Transport(#[from] ChannelError),

    #[error("handshake cancelled")]
    Cancelled,

    #[error("{0} missing from the resource set")]
    Incomplete(ResourceKind),

    #[error("{len} byte datagram exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("path resolution: {0}")]
    Path(#[from] PathError),
}

/// The engine's event loop has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("engine stopped")]
pub struct EngineStopped;

impl SetupError {
    pub(crate) fn allocation(resource: ResourceKind) -> impl FnOnce(VerbsError) -> SetupError {
        move |source| SetupError::Allocation { resource, source }
    }

    pub(crate) fn transition(target: QpState) -> impl FnOnce(VerbsError) -> SetupError {
        move |source| SetupError::Transition { target, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use udrv_verbs::error::libc_errno::ENOMEM;

    #[test]
    fn test_allocation_display() {
        let err = SetupError::allocation(ResourceKind::RecvCq)(VerbsError::Rejected {
            op: "create_cq",
            errno: ENOMEM,
        });
        assert_eq!(
            err.to_string(),
            "receive CQ allocation failed: create_cq rejected by device (errno 12)"
        );
    }

    #[test]
    fn test_transition_display() {
        let err = SetupError::transition(QpState::ReadyToReceive)(VerbsError::Rejected {
            op: "modify_qp",
            errno: 22,
        });
        assert!(err.to_string().starts_with("QP transition to RTR failed"));
    }

    #[test]
    fn test_path_error_into_setup() {
        let err: SetupError = PathError::Failed { status: -110 }.into();
        assert_eq!(
            err.to_string(),
            "path resolution: path query completed with status -110"
        );
    }

    #[test]
    fn test_config_invalid_display() {
        let err = ConfigError::invalid("cq_size", "must be in 1..=65535");
        assert_eq!(err.to_string(), "invalid cq_size: must be in 1..=65535");
    }
}

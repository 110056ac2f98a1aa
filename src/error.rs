//! Error taxonomy.
//!
//! Registration errors are local and never cross the network. Wire-level
//! failures found by the server travel back as a [`ProtocolFault`], while
//! failures raised by a service implementation travel back as an
//! [`ApplicationError`]. The client sees all of them through [`RpcError`].

use crate::{contract::ServiceId, types::TypeMismatch};
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown service {0}")]
    UnknownService(ServiceId),

    #[error("service {service} has no method with index {index}")]
    UnknownMethod { service: ServiceId, index: u32 },

    #[error("service {service} has no method named `{name}`")]
    UnknownMethodName { service: ServiceId, name: String },

    #[error("no implementation bound for service {0}")]
    NoImplementationBound(ServiceId),

    #[error("service {0} is already registered")]
    DuplicateService(ServiceId),

    #[error("service {0} already has an implementation bound")]
    AlreadyBound(ServiceId),
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    #[error("unknown outcome tag {0}")]
    UnknownOutcomeTag(u32),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::MalformedFrame(err.to_string())
    }
}

/// Why the server could not dispatch a request. Sent back in place of a result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ProtocolFault {
    #[error("unknown service {0}")]
    UnknownService(ServiceId),

    #[error("service {service} has no method with index {index}")]
    UnknownMethod { service: ServiceId, index: u32 },

    #[error("no implementation bound for service {0}")]
    NoImplementationBound(ServiceId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    TypeMismatch(TypeMismatch),

    #[error("unknown outcome tag {0}")]
    UnknownOutcomeTag(u32),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ProtocolFault {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownService(id) => ProtocolFault::UnknownService(id),
            RegistryError::UnknownMethod { service, index } => {
                ProtocolFault::UnknownMethod { service, index }
            }
            RegistryError::NoImplementationBound(id) => ProtocolFault::NoImplementationBound(id),
            other => ProtocolFault::Internal(other.to_string()),
        }
    }
}

impl From<CodecError> for ProtocolFault {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedFrame(msg) => ProtocolFault::MalformedFrame(msg),
            CodecError::TypeMismatch(mismatch) => ProtocolFault::TypeMismatch(mismatch),
            CodecError::UnknownOutcomeTag(tag) => ProtocolFault::UnknownOutcomeTag(tag),
        }
    }
}

/// A failure raised by a service implementation, carried to the caller as data.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApplicationError {
    pub message: String,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for ApplicationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ApplicationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

// Arguments are type-checked before an implementation runs, so this only
// fires when an implementation decodes its arguments differently than its
// descriptor declares them.
impl From<TypeMismatch> for ApplicationError {
    fn from(err: TypeMismatch) -> Self {
        Self::new(format!("argument decoding failed: {err}"))
    }
}

/// Returned by the transport when the connection is no longer open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("remote application error: {0}")]
    RemoteApplication(ApplicationError),

    #[error("protocol error reported by peer: {0}")]
    Protocol(ProtocolFault),

    #[error("call {call_id} timed out after {timeout:?}")]
    CallTimeout { call_id: u64, timeout: Duration },

    #[error("connection lost while the call was pending")]
    ConnectionLost,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Liveness failures the caller may choose to retry. Nothing is retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::CallTimeout { .. } | RpcError::ConnectionLost)
    }
}

impl From<ConnectionClosed> for RpcError {
    fn from(_: ConnectionClosed) -> Self {
        RpcError::ConnectionClosed
    }
}

impl From<TypeMismatch> for RpcError {
    fn from(err: TypeMismatch) -> Self {
        RpcError::Codec(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_faults() {
        let id = ServiceId::new("UserService", 1);
        assert_eq!(
            ProtocolFault::from(RegistryError::UnknownMethod {
                service: id.clone(),
                index: 5
            }),
            ProtocolFault::UnknownMethod {
                service: id.clone(),
                index: 5
            }
        );
        assert!(matches!(
            ProtocolFault::from(RegistryError::AlreadyBound(id)),
            ProtocolFault::Internal(_)
        ));
    }

    #[test]
    fn only_liveness_failures_are_retryable() {
        assert!(RpcError::ConnectionLost.is_retryable());
        assert!(RpcError::CallTimeout {
            call_id: 1,
            timeout: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(!RpcError::ConnectionClosed.is_retryable());
        assert!(!RpcError::RemoteApplication("nope".into()).is_retryable());
    }

    #[test]
    fn application_error_displays_its_message() {
        assert_eq!(
            RpcError::RemoteApplication("user not found".into()).to_string(),
            "remote application error: user not found"
        );
    }
}

use crate::protocol::opcodes::NackReason;

/// Failures reported to users of a [crate::service_link::service_link::ServiceLink].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("not connected to a hub")]
    NotConnected,
    #[error("timed out waiting for the hub")]
    Timeout,
    #[error("giving up on connecting to a hub")]
    Failed,
    #[error("virtual connection refused: {0}")]
    Refused(NackReason),
    #[error("no virtual connection with index {0}")]
    UnknownCircuit(u64),
    #[error("virtual connection was closed")]
    CircuitClosed,
    #[error("virtual connection {0} is not established yet")]
    NotEstablished(u64),
    #[error("a virtual connection callback is already registered")]
    CallbackAlreadyRegistered,
    #[error("a handler for module '{0}' is already registered")]
    ModuleAlreadyRegistered(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

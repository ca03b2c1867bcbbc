/// Error types for the single-instance guard
use crate::lock::Role;
use std::io;
use thiserror::Error;

/// Everything that can go wrong while coordinating instances
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The OS lock primitive could not be created. Startup cannot tell whether
    /// another instance is running and should abort.
    #[error("failed to create instance lock `{name}`: {source}")]
    LockCreationFailed {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A secondary could not reach the primary's endpoint
    #[error("failed to reach primary instance at `{endpoint}`: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The primary could not open its activation endpoint
    #[error("failed to bind activation endpoint `{endpoint}`: {source}")]
    ListenerBindFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("an activation listener is already registered")]
    DuplicateListenerRegistration,

    #[error("no activation listener is registered")]
    ListenerNotRegistered,

    #[error("operation requires the {expected:?} role but this instance is {actual:?}")]
    WrongRole { expected: Role, actual: Role },

    #[error("activation listener already started")]
    ListenerAlreadyStarted,

    /// A frame on the wire was oversized or failed to decode
    #[error("malformed activation message: {0}")]
    Protocol(String),

    #[error("invalid instance name `{0}`: use ASCII letters, digits, '.', '-' or '_'")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for InstanceError {
    fn from(e: bincode::Error) -> Self {
        InstanceError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InstanceError>;

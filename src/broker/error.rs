//! Broker error taxonomy and its mapping onto wire status codes.
//!
//! Every per-request failure ends up as a [`Status`] byte in the response
//! header. None of them terminates the broker.

use thiserror::Error;

/// Status byte carried in every control response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// The request succeeded and exactly one descriptor is attached.
    Success = 0,
    /// Bad framing, bad length or unsupported protocol version.
    MalformedMessage = 1,
    /// The opcode is not part of the supported operation set.
    UnsupportedOperation = 2,
    /// The endpoint factory could not allocate the channel resource.
    ResourceExhausted = 3,
    /// The named channel does not exist.
    NotFound = 4,
    /// The peer is not in the permitted uid/gid sets.
    PermissionDenied = 5,
    /// A registry invariant was violated. Should be unreachable.
    InternalError = 6,
}

impl Status {
    /// Decode a status byte. Unknown values map to `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::MalformedMessage),
            2 => Some(Self::UnsupportedOperation),
            3 => Some(Self::ResourceExhausted),
            4 => Some(Self::NotFound),
            5 => Some(Self::PermissionDenied),
            6 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Wire value of this status.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `true` for [`Status::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::MalformedMessage => "malformed message",
            Self::UnsupportedOperation => "unsupported operation",
            Self::ResourceExhausted => "resource exhausted",
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Errors raised while serving a control request.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Framing, length, terminator or version problem.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Opcode outside the closed operation set.
    #[error("unsupported operation 0x{0:02x}")]
    UnsupportedOperation(u8),

    /// The endpoint factory could not allocate a resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Channel or handle no longer present in the registry.
    #[error("channel not found: {0}")]
    NotFound(String),

    /// Peer credentials were rejected.
    #[error("permission denied for uid {uid} gid {gid}")]
    PermissionDenied {
        /// Peer user id.
        uid: u32,
        /// Peer group id.
        gid: u32,
    },

    /// Registry invariant violation.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl BrokerError {
    /// Status code reported to the client for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::MalformedMessage(_) => Status::MalformedMessage,
            Self::UnsupportedOperation(_) => Status::UnsupportedOperation,
            Self::ResourceExhausted(_) => Status::ResourceExhausted,
            Self::NotFound(_) => Status::NotFound,
            Self::PermissionDenied { .. } => Status::PermissionDenied,
            Self::InternalError(_) => Status::InternalError,
        }
    }
}

/// Result alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

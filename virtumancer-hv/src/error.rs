//! Hypervisor error types.

use thiserror::Error;

/// What went wrong, independent of the driver that reported it.
///
/// Callers classify on this kind; the message is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvErrorKind {
    /// The hypervisor could not be reached.
    Unreachable,
    /// The hypervisor refused our credentials.
    Auth,
    /// No driver understands the URI.
    UnsupportedUri,
    /// Domain (or other object) does not exist.
    NotFound,
    /// The operation is invalid in the object's current state.
    InvalidOperation,
    /// An established connection broke.
    ConnectionLost,
    /// The hypervisor did not answer in time.
    Timeout,
    /// The driver does not implement this capability.
    Unsupported,
    /// Anything else reported by the hypervisor.
    Internal,
}

/// Error returned by every HCI operation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct HvError {
    pub kind: HvErrorKind,
    pub message: String,
}

impl HvError {
    pub fn new(kind: HvErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(HvErrorKind::NotFound, what)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(HvErrorKind::InvalidOperation, message)
    }

    pub fn unsupported(capability: &str) -> Self {
        Self::new(
            HvErrorKind::Unsupported,
            format!("{} is not supported by this driver", capability),
        )
    }

    /// True when the connection itself is unusable and should be re-established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self.kind,
            HvErrorKind::ConnectionLost | HvErrorKind::Unreachable
        )
    }
}

/// Result type for HCI operations.
pub type Result<T> = std::result::Result<T, HvError>;

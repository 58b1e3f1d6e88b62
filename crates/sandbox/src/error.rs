use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop the engine from producing an [`ExecutionResult`].
///
/// Mount failures, user-script failures and timeouts are not errors: they are
/// reported inside the result.
///
/// [`ExecutionResult`]: crate::ExecutionResult
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "control plane unreachable at {}: {reason}; ensure the isolation daemon is running and its socket is accessible",
        socket.display()
    )]
    ControlPlaneUnavailable { socket: PathBuf, reason: String },

    #[error("failed to resolve image {image}: {message}")]
    ImageResolution { image: String, message: String },

    #[error("isolation layer {operation} failed: {message}")]
    Isolation {
        operation: &'static str,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn isolation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Isolation {
            operation,
            message: message.into(),
        }
    }

    /// Whether the failure happened before any environment could exist.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            Self::ControlPlaneUnavailable { .. } | Self::ImageResolution { .. } | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_message_carries_remediation_hint() {
        let err = Error::ControlPlaneUnavailable {
            socket: PathBuf::from("/var/run/docker.sock"),
            reason: "No such file or directory".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/var/run/docker.sock"));
        assert!(msg.contains("ensure the isolation daemon is running"));
        assert!(err.is_pre_flight());
    }

    #[test]
    fn isolation_errors_are_not_pre_flight() {
        let err = Error::isolation("start", "oci runtime error");
        assert_eq!(err.to_string(), "isolation layer start failed: oci runtime error");
        assert!(!err.is_pre_flight());
    }
}

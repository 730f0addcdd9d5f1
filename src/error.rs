//! Error taxonomy for orchestration operations
//!
//! Only errors that keep a container from reaching a started state end an
//! operation. Exposure, proxy and volume-maintenance failures are reported
//! through the same type but are logged and swallowed by the caller.

use crate::instance::Protocol;
use thiserror::Error;

/// Errors raised by the orchestration control plane
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Requested port is held by another instance or process
    #[error("port {port}/{protocol} is already in use")]
    ResourceConflict { port: u16, protocol: Protocol },

    /// Every port in the configured pool is allocated or busy
    #[error("no free port left in pool {start}-{end}")]
    PoolExhausted { start: u16, end: u16 },

    /// Container engine could not be reached
    #[error("container engine unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to pull image '{image}': {reason}")]
    ImagePullFailure { image: String, reason: String },

    #[error("failed to fix volume permissions: {0}")]
    PermissionFixFailure(String),

    #[error("failed to write config file: {0}")]
    ConfigWriteFailure(String),

    #[error("network exposure failed: {0}")]
    NetworkExposureFailure(String),

    #[error("proxy sync failed: {0}")]
    ProxyWriteFailure(String),

    /// Tracked container no longer exists in the engine
    #[error("container not found: {0}")]
    DriftNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// Any other error reported by the container engine
    #[error("container operation failed: {0}")]
    Container(String),

    #[error("timed out after {secs}s while {action}")]
    Timeout { action: String, secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether this error means the tracked container vanished
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::DriftNotFound(_))
    }

    /// Whether this error must end a start with status `error`
    pub fn is_fatal_for_start(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::PermissionFixFailure(_)
                | OrchestratorError::ConfigWriteFailure(_)
                | OrchestratorError::NetworkExposureFailure(_)
                | OrchestratorError::ProxyWriteFailure(_)
        )
    }
}

/// Classify a bollard error into the orchestration taxonomy
///
/// `subject` names the container, image or network the call was about and
/// is used for not-found errors.
pub fn classify_engine_error(subject: &str, err: bollard::errors::Error) -> OrchestratorError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => OrchestratorError::DriftNotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            if is_port_conflict_message(&message) {
                OrchestratorError::ResourceConflict {
                    port: port_from_conflict_message(&message).unwrap_or(0),
                    protocol: Protocol::Tcp,
                }
            } else {
                OrchestratorError::Container(format!("{} (HTTP {})", message, status_code))
            }
        }
        other => OrchestratorError::RuntimeUnavailable(other.to_string()),
    }
}

fn is_port_conflict_message(message: &str) -> bool {
    message.contains("port is already allocated") || message.contains("address already in use")
}

/// Extract the host port from engine messages like
/// `Bind for 0.0.0.0:25565 failed: port is already allocated`
fn port_from_conflict_message(message: &str) -> Option<u16> {
    message
        .split_whitespace()
        .filter_map(|word| word.rsplit_once(':'))
        .find_map(|(_, port)| port.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_not_found_maps_to_drift() {
        let err = classify_engine_error("serverdock-alpha", server_error(404, "No such container"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "container not found: serverdock-alpha");
    }

    #[test]
    fn test_port_conflict_is_detected() {
        let err = classify_engine_error(
            "serverdock-alpha",
            server_error(
                500,
                "driver failed programming external connectivity: Bind for 0.0.0.0:25565 failed: port is already allocated",
            ),
        );
        match err {
            OrchestratorError::ResourceConflict { port, .. } => assert_eq!(port, 25565),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_server_errors_are_container_errors() {
        let err = classify_engine_error("x", server_error(500, "OCI runtime create failed"));
        assert!(matches!(err, OrchestratorError::Container(_)));
        assert!(err.is_fatal_for_start());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!OrchestratorError::ProxyWriteFailure("x".into()).is_fatal_for_start());
        assert!(!OrchestratorError::NetworkExposureFailure("x".into()).is_fatal_for_start());
        assert!(!OrchestratorError::PermissionFixFailure("x".into()).is_fatal_for_start());
        assert!(OrchestratorError::RuntimeUnavailable("x".into()).is_fatal_for_start());
    }
}

use std::time::Duration;

use thiserror::Error;

/// Error types for the relay
///
/// Variants follow the three failure families the relay distinguishes:
/// transport (upstream socket, transcoder process), protocol (malformed
/// frames) and capability (detection, translation, synthesis, persistence).
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream session is not in the `connected` state
    #[error("Upstream not ready")]
    UpstreamNotReady,

    /// Opening the upstream socket failed
    #[error("Failed to connect upstream: {0}")]
    UpstreamConnect(String),

    /// The provider rejected our credentials (HTTP 401/403 on upgrade)
    #[error("Upstream rejected credentials: {0}")]
    UpstreamAuth(String),

    /// Failed to spawn the transcoder subprocess
    #[error("Failed to start transcoder: {0}")]
    TranscoderSpawn(String),

    /// The transcoder exited uncleanly or lost its pipes
    #[error("Transcoder failed: {0}")]
    TranscoderFailed(String),

    /// A frame did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An external capability call returned an error
    #[error("{capability} failed: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    /// An external capability call did not finish in time
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Network(#[from] reqwest::Error),
}

impl RelayError {
    pub fn capability(capability: &'static str, message: impl Into<String>) -> Self {
        RelayError::Capability {
            capability,
            message: message.into(),
        }
    }

    /// True for failures that should tear down the upstream connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamConnect(_)
                | RelayError::UpstreamAuth(_)
                | RelayError::TranscoderSpawn(_)
                | RelayError::TranscoderFailed(_)
        )
    }
}

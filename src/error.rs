use thiserror::Error;

/// Errors that can occur when working with AromaTech diffusers
#[derive(Error, Debug)]
pub enum AromaTechError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Connect, write or notify failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport dropped while the session was using it
    #[error("Device disconnected")]
    Disconnected,

    /// Expected acknowledgment did not arrive in time
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Device not found during scanning
    #[error("AromaTech device not found")]
    DeviceNotFound,

    /// Identification frame missing or malformed
    #[error("Device identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Device refused the supplied password
    #[error("Authentication rejected by device")]
    AuthenticationRejected,

    /// Device never answered the login frame
    #[error("Authentication timed out after {timeout_ms}ms")]
    AuthenticationTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Password does not have the required shape
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Intensity outside `1..=max`
    #[error("Invalid intensity {level}: device accepts 1..={max}")]
    InvalidIntensity {
        /// Requested level
        level: u8,
        /// Maximum level supported by the device
        max: u8,
    },

    /// Command issued without a live connection
    #[error("Device not connected")]
    NotConnected,

    /// Command issued before the login handshake completed
    #[error("Session not authenticated")]
    NotAuthenticated,

    /// Frame could not be decoded
    #[error("Decode anomaly: {0}")]
    DecodeAnomaly(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for AromaTech operations
pub type Result<T> = std::result::Result<T, AromaTechError>;

impl AromaTechError {
    /// Check if this error is a transport problem eligible for reconnection
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Transport(_)
                | Self::Disconnected
                | Self::Timeout { .. }
                | Self::AuthenticationTimeout { .. }
        )
    }

    /// Check if this error reports caller misuse that must not be retried
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidIntensity { .. }
                | Self::InvalidCredential(_)
                | Self::NotConnected
                | Self::NotAuthenticated
        )
    }

    /// Check if retrying with the same credential is pointless
    #[must_use]
    pub const fn is_fatal_for_credential(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRejected | Self::InvalidCredential(_)
        )
    }
}

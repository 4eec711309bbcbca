//! Error taxonomy for the voice session controller.

/// Failures while acquiring the local microphone.
///
/// Returned by [`crate::collaborators::AudioDevice`] implementations so the
/// controller can tell a refused permission apart from a missing or busy device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no audio capture device available: {0}")]
    Unavailable(String),
    #[error("audio capture device is busy: {0}")]
    Busy(String),
}

/// Every failure a voice session can surface to its owner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),
    #[error("Session creation failed: {0}")]
    SessionCreationFailed(String),
    #[error("Transport negotiation failed: {0}")]
    TransportNegotiationFailed(String),
    #[error("Event channel error: {0}")]
    ChannelError(String),
    #[error("Remote protocol error: {0}")]
    RemoteProtocolError(String),
    #[error("Accounting submission failed: {0}")]
    AccountingSubmissionFailed(String),
    #[error("Connection lost after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Connection attempt cancelled by session teardown")]
    Cancelled,
}

impl SessionError {
    /// Whether the reconnection scheduler may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportNegotiationFailed(_) | SessionError::ChannelError(_)
        )
    }

    /// Permission and hardware failures, which are surfaced immediately.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::DeviceUnavailable(_)
                | SessionError::DeviceBusy(_)
        )
    }
}

impl From<DeviceError> for SessionError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            DeviceError::Unavailable(msg) => SessionError::DeviceUnavailable(msg),
            DeviceError::Busy(msg) => SessionError::DeviceBusy(msg),
        }
    }
}

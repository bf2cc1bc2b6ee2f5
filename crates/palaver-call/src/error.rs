use thiserror::Error;

/// Local media (camera/microphone) acquisition failures.
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,

    #[error("Media device busy")]
    DeviceBusy,

    #[error("Media unavailable: {0}")]
    Unavailable(String),
}

/// Peer transport failures.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The advertised address is already taken, usually by a dead handle
    /// from a previous process instance.
    #[error("Peer address already in use: {0}")]
    AddressInUse(String),

    #[error("Peer endpoint destroyed")]
    Destroyed,

    #[error("Peer connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer transport error: {0}")]
    Transport(String),
}

/// Failure carrying an outbound signal to the counterpart.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Signal transport error: {0}")]
    Transport(String),
}

/// Engine-internal failure. Never surfaced to a caller; always absorbed
/// into a state transition.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    #[error("Timed out waiting for local media")]
    MediaTimeout,

    #[error("Timed out waiting for peer connection")]
    ConnectTimeout,
}

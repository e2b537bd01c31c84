//! Error types shared by the core state machines and the runtime drivers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("broadcast bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("realtime channel is not connected")]
    Disconnected,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("unknown realtime event: {0}")]
    UnknownEvent(String),

    #[error("channel {channel} already subscribed with a different payload type")]
    ChannelTypeMismatch { channel: String },
}

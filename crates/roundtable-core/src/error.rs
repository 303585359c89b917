use thiserror::Error;

/// Error taxonomy for the orchestration runtime.
///
/// These are not exceptions to be caught blindly — each variant routes to a
/// specific recovery policy. Callers match on the variant rather than on a
/// string message.
#[derive(Debug, Error)]
pub enum RoundtableError {
    #[error("channel lock timed out after {ms}ms waiting for '{holder_label}'")]
    LockTimeout { ms: u64, holder_label: String },

    #[error("transport gate timed out after {ms}ms")]
    GateTimeout { ms: u64 },

    #[error("stream idle for {ms}ms")]
    StreamIdle { ms: u64 },

    #[error("stream hit hard stop after {ms}ms")]
    HardStop { ms: u64 },

    #[error("stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    #[error("unknown agent id: {id}")]
    UnknownAgent { id: String },

    #[error("duplicate agent id: {id}")]
    DuplicateAgent { id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RoundtableError {
    /// Short error code, stable across message-text changes, for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            RoundtableError::LockTimeout { .. } => "LOCK_TIMEOUT",
            RoundtableError::GateTimeout { .. } => "GATE_TIMEOUT",
            RoundtableError::StreamIdle { .. } => "STREAM_IDLE",
            RoundtableError::HardStop { .. } => "HARD_STOP",
            RoundtableError::StreamInterrupted { .. } => "STREAM_INTERRUPTED",
            RoundtableError::UnknownAgent { .. } => "UNKNOWN_AGENT",
            RoundtableError::DuplicateAgent { .. } => "DUPLICATE_AGENT",
            RoundtableError::Config(_) => "CONFIG_ERROR",
            RoundtableError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RoundtableError>;

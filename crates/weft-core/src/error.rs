use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Skill error ({skill}): {reason}")]
    Skill { skill: String, reason: String },

    #[error("Skill denied ({skill}): {reason}")]
    SkillDenied { skill: String, reason: String },

    #[error("Authentication failed")]
    AuthFailure,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Sequence gap on task {task_id}: missed {missed} envelopes")]
    SequenceGap { task_id: String, missed: u64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WeftError {
    /// Short error code string for audit entries and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WeftError::ConfigMissing(_) => "CONFIG_MISSING",
            WeftError::Config(_) => "CONFIG_ERROR",
            WeftError::BusUnavailable(_) => "BUS_UNAVAILABLE",
            WeftError::Model(_) => "MODEL_ERROR",
            WeftError::Skill { .. } => "SKILL_ERROR",
            WeftError::SkillDenied { .. } => "SKILL_DENIED",
            WeftError::AuthFailure => "AUTH_FAILURE",
            WeftError::RateLimited(_) => "RATE_LIMITED",
            WeftError::Timeout { .. } => "TIMEOUT",
            WeftError::SequenceGap { .. } => "SEQUENCE_GAP",
            WeftError::Conflict(_) => "CONFLICT",
            WeftError::Database(_) => "DATABASE_ERROR",
            WeftError::Serialization(_) => "SERIALIZATION_ERROR",
            WeftError::Io(_) => "IO_ERROR",
            WeftError::EnvelopeTooLarge { .. } => "ENVELOPE_TOO_LARGE",
            WeftError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Localized, non-technical text shown to the user when a task fails.
    /// Internal detail goes to the audit log, never to the chat.
    pub fn user_message(&self) -> &'static str {
        match self {
            WeftError::Model(_) => "The model is unavailable right now. Please try again.",
            WeftError::RateLimited(_) => "Too many requests. Please slow down.",
            _ => "Something went wrong on our side. Please try again.",
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

use std::fmt;

/// Why a job was refused at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    /// Every concurrent-job slot is taken; retry once a job finishes.
    ConcurrentJobs,
    /// The spec asks for more than a hard per-job limit allows.
    StructuralLimit,
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionReason::ConcurrentJobs => write!(f, "concurrent job limit"),
            AdmissionReason::StructuralLimit => write!(f, "per-job limit"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Admission rejected ({reason}): {message}")]
    Admission {
        reason: AdmissionReason,
        message: String,
    },
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Job already terminal: {0}")]
    AlreadyTerminal(String),
    #[error("Job still active: {0}")]
    JobActive(String),
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn admission(reason: AdmissionReason, message: impl Into<String>) -> Self {
        EngineError::Admission {
            reason,
            message: message.into(),
        }
    }

    /// HTTP status the REST layer answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::Config(_) => 400,
            EngineError::Admission {
                reason: AdmissionReason::ConcurrentJobs,
                ..
            } => 429,
            EngineError::Admission {
                reason: AdmissionReason::StructuralLimit,
                ..
            } => 403,
            EngineError::NotFound(_) => 404,
            EngineError::AlreadyTerminal(_) | EngineError::JobActive(_) => 409,
            EngineError::Timeout(_) => 504,
            EngineError::ConnectionFailure(_) | EngineError::Protocol(_) => 502,
            EngineError::Io(_) => 500,
        }
    }

    /// Short machine-readable kind used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Admission { .. } => "admission_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyTerminal(_) => "already_terminal",
            EngineError::JobActive(_) => "job_active",
            EngineError::ConnectionFailure(_) => "connection_failure",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Timeout(_) => "timeout",
            EngineError::Config(_) => "config_error",
            EngineError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

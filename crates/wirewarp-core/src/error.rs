use thiserror::Error;

/// Errors produced by the WireWarp agent.
#[derive(Debug, Error)]
pub enum WarpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("auth rejected: {0}")]
    AuthRejected(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("parse params: {0}")]
    InvalidParams(String),

    /// An external networking command failed; `output` carries its captured
    /// stdout/stderr so the control plane sees the real diagnostic.
    #[error("{command}: {output}")]
    Backend { command: String, output: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotInitialised(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WarpError {
    /// Prefix the error message with the step that failed, keeping the
    /// variant for `Backend` errors so the diagnostic survives.
    pub fn context(self, step: &str) -> Self {
        match self {
            WarpError::Backend { command, output } => WarpError::Backend {
                command: format!("{step}: {command}"),
                output,
            },
            other => WarpError::Other(format!("{step}: {other}")),
        }
    }
}

impl From<serde_json::Error> for WarpError {
    fn from(e: serde_json::Error) -> Self {
        WarpError::Codec(e.to_string())
    }
}

pub type WarpResult<T> = Result<T, WarpError>;

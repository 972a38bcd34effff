use thiserror::Error;

/// A single failed call to the remote image generation API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("remote call failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote call returned no image data")]
    EmptyResponse,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GenerationError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => GenerationError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_timeout() => GenerationError::Transport(format!("timeout: {}", err)),
            None if err.is_connect() => {
                GenerationError::Transport(format!("connection failed: {}", err))
            }
            None => GenerationError::Transport(err.to_string()),
        }
    }
}

/// Errors that end a book processing run.
///
/// Remote failures never show up here; they are absorbed per page.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("caller contract violated: {0}")]
    ContractViolation(String),

    #[error("run was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Batch size must be > 0, got {0}")]
    InvalidBatchSize(usize),

    #[error("Max retries must be > 0, got {0}")]
    InvalidMaxRetries(u32),

    #[error("Rate limit min delay ({min_ms}ms) exceeds max delay ({max_ms}ms)")]
    InvalidRateLimit { min_ms: u64, max_ms: u64 },

    #[error("Environment variable {name} has an invalid value: {value}")]
    InvalidValue { name: &'static str, value: String },
}

pub type GenerationResult<T> = Result<T, GenerationError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job spec: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Job manager is shut down")]
    ShutDown,

    #[error("Failed to launch attempt: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

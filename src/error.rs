use thiserror::Error;
use tonic::Status;

use crate::job::JobId;
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Command cannot be empty")]
    InvalidCommand,

    // Same message whether the id is malformed, absent or owned by someone else.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} has already been started")]
    AlreadyStarted(JobId),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl From<WorkerError> for Status {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::InvalidCommand => Status::invalid_argument(err.to_string()),
            WorkerError::JobNotFound(_) => Status::not_found(err.to_string()),
            WorkerError::AlreadyStarted(_) => Status::failed_precondition(err.to_string()),
            WorkerError::Unauthenticated(_) => Status::unauthenticated(err.to_string()),
            WorkerError::ProcessSpawnFailed(_)
            | WorkerError::Tls(_)
            | WorkerError::TransportError(_)
            | WorkerError::Io(_) => Status::internal(err.to_string()),
        }
    }
}

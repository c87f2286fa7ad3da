// Error taxonomy for the supervision core
//
// Local validation errors are rejected synchronously and never retried.
// Session and process failures are converted into events at the component
// boundary and never cross it as raw I/O errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("agent already running for project {0}")]
    AlreadyRunning(String),

    #[error("project {0} is already queued")]
    AlreadyQueued(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("no agent running for project {0}")]
    NotRunning(String),

    #[error("loop already running for project {0}")]
    LoopAlreadyRunning(String),

    #[error("ralph task not found: {0}")]
    TaskNotFound(String),

    #[error("ralph task {0} is not in a state that allows this transition")]
    InvalidTaskState(String),

    #[error("no roadmap found for project {0}")]
    RoadmapMissing(String),

    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ForemanError::AlreadyRunning("proj-1".to_string());
        assert_eq!(err.to_string(), "agent already running for project proj-1");

        let err = ForemanError::AlreadyQueued("proj-1".to_string());
        assert_eq!(err.to_string(), "project proj-1 is already queued");

        let err = ForemanError::ProjectNotFound("missing".to_string());
        assert_eq!(err.to_string(), "project not found: missing");
    }

    #[test]
    fn test_from_anyhow() {
        let err: ForemanError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}

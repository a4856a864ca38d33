use autopilot_core::{ClassifiedError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Workspace already exists: {0}")]
    WorkspaceAlreadyExists(String),

    #[error("Invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("VCS not initialized in repository: {0}")]
    NotInitialized(String),

    #[error("Duplicate unit of work: {0}")]
    DuplicateUnit(String),

    #[error("Unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Dependency cycle between units: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    /// Errors caused by the shape of the input rather than the environment.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            VcsError::DuplicateUnit(_)
                | VcsError::UnknownDependency { .. }
                | VcsError::DependencyCycle(_)
                | VcsError::WorkspaceAlreadyExists(_)
                | VcsError::InvalidPath(_)
                | VcsError::NotInitialized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Classification at the boundary: structural problems are fatal, git
/// command failures may be transient, local I/O is retried immediately.
impl From<VcsError> for ClassifiedError {
    fn from(err: VcsError) -> Self {
        let message = err.to_string();
        let classified = match &err {
            VcsError::DependencyCycle(units) => {
                ClassifiedError::fatal(ErrorCode::DependencyCycle, message)
                    .with_context("units", units)
            }
            VcsError::DuplicateUnit(_) | VcsError::UnknownDependency { .. } => {
                ClassifiedError::fatal(ErrorCode::UnknownUnit, message)
            }
            VcsError::CommandFailed(_) => {
                ClassifiedError::retryable(ErrorCode::SourceControl, message)
            }
            VcsError::Io(_) => ClassifiedError::recoverable(ErrorCode::Io, message),
            _ => ClassifiedError::fatal(ErrorCode::SourceControl, message),
        };
        classified.with_source(err)
    }
}

//! Error classification helpers for the execution core.
//!
//! Everything raised by this crate is an [`autopilot_core::ClassifiedError`].
//! Foreign failures are classified here, at the point where they occur.

use std::path::Path;

pub use autopilot_core::{ClassifiedError, ErrorCode, ErrorKind, ErrorRecord, Result};

/// Local filesystem failure. Momentary by assumption, so retried without backoff.
pub fn io_error(action: &str, path: &Path, err: std::io::Error) -> ClassifiedError {
    ClassifiedError::recoverable(
        ErrorCode::Io,
        format!("failed to {} {}: {}", action, path.display(), err),
    )
    .with_context("path", path.display().to_string())
    .with_source(err)
}

/// A state write that did not land. Never accepted silently.
pub fn state_write_error(path: &Path, err: std::io::Error) -> ClassifiedError {
    ClassifiedError::fatal(
        ErrorCode::StateWrite,
        format!("failed to persist {}: {}", path.display(), err),
    )
    .with_context("path", path.display().to_string())
    .with_source(err)
}

pub fn serialization_error(what: &str, err: serde_json::Error) -> ClassifiedError {
    ClassifiedError::fatal(
        ErrorCode::Serialization,
        format!("failed to serialize {}: {}", what, err),
    )
    .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_recoverable_with_path() {
        let err = io_error(
            "read",
            Path::new("/tmp/state.json"),
            std::io::Error::new(std::io::ErrorKind::Other, "busy"),
        );
        assert!(err.is_recoverable());
        assert_eq!(err.context["path"], "/tmp/state.json");
        assert!(err.to_string().contains("path=/tmp/state.json"));
    }

    #[test]
    fn test_state_write_error_is_fatal() {
        let err = state_write_error(
            Path::new("state.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::StateWrite);
    }
}

//! Error taxonomy shared by every part of the execution core.
//!
//! Each failure is classified at the point where it happens into exactly one
//! of three kinds:
//!
//! - [`ErrorKind::Recoverable`] - retried immediately, no backoff
//! - [`ErrorKind::Retryable`] - retried after exponential backoff
//! - [`ErrorKind::Fatal`] - never retried, escalated or propagated
//!
//! No core operation returns anything but a [`ClassifiedError`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The three disjoint failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    Recoverable,
    /// `max_retries` narrows the retry policy's budget when set.
    Retryable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_retries: Option<u32>,
    },
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Retryable { .. } => "retryable",
            Self::Fatal => "fatal",
        }
    }
}

/// Machine-stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LockContention,
    Io,
    WorkerRateLimited,
    WorkerUnavailable,
    WorkerTimeout,
    WorkerAuth,
    WorkerFailed,
    RetriesExhausted,
    StateCorruption,
    StateWrite,
    InvalidDefinition,
    InvalidState,
    InvalidResume,
    InvalidProjectId,
    UndefinedVariable,
    RenderFailed,
    StepLimitExceeded,
    DependencyCycle,
    UnknownUnit,
    SourceControl,
    EscalationNotFound,
    EscalationAlreadyResolved,
    EscalationAlreadyAnswered,
    EscalationNotPending,
    MissingCollaborator,
    InvalidConfig,
    Serialization,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockContention => "lock_contention",
            Self::Io => "io",
            Self::WorkerRateLimited => "worker_rate_limited",
            Self::WorkerUnavailable => "worker_unavailable",
            Self::WorkerTimeout => "worker_timeout",
            Self::WorkerAuth => "worker_auth",
            Self::WorkerFailed => "worker_failed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::StateCorruption => "state_corruption",
            Self::StateWrite => "state_write",
            Self::InvalidDefinition => "invalid_definition",
            Self::InvalidState => "invalid_state",
            Self::InvalidResume => "invalid_resume",
            Self::InvalidProjectId => "invalid_project_id",
            Self::UndefinedVariable => "undefined_variable",
            Self::RenderFailed => "render_failed",
            Self::StepLimitExceeded => "step_limit_exceeded",
            Self::DependencyCycle => "dependency_cycle",
            Self::UnknownUnit => "unknown_unit",
            Self::SourceControl => "source_control",
            Self::EscalationNotFound => "escalation_not_found",
            Self::EscalationAlreadyResolved => "escalation_already_resolved",
            Self::EscalationAlreadyAnswered => "escalation_already_answered",
            Self::EscalationNotPending => "escalation_not_pending",
            Self::MissingCollaborator => "missing_collaborator",
            Self::InvalidConfig => "invalid_config",
            Self::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure with its classification and structured context.
#[derive(Error, Debug)]
#[error("[{code}] {message}{}", describe_context(.context, .source))]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub context: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    #[source]
    pub source: Option<BoxedCause>,
}

fn describe_context(context: &BTreeMap<String, Value>, source: &Option<BoxedCause>) -> String {
    let mut out = String::new();
    let located: Vec<String> = ["project_id", "step_index", "path"]
        .iter()
        .filter_map(|key| context.get(*key).map(|v| format!("{}={}", key, plain(v))))
        .collect();
    if !located.is_empty() {
        out.push_str(&format!(" ({})", located.join(", ")));
    }
    if let Some(cause) = source {
        out.push_str(&format!(": {}", cause));
    }
    out
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ClassifiedError {
    fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: BTreeMap::new(),
            timestamp: Utc::now(),
            retry_count: 0,
            source: None,
        }
    }

    pub fn recoverable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Recoverable, code, message)
    }

    /// Retryable under whatever budget the retry policy grants.
    pub fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable { max_retries: None }, code, message)
    }

    /// Retryable error carrying its own, tighter retry ceiling.
    pub fn retryable_with(code: ErrorCode, message: impl Into<String>, max_retries: u32) -> Self {
        Self::new(
            ErrorKind::Retryable {
                max_retries: Some(max_retries),
            },
            code,
            message,
        )
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, code, message)
    }

    /// Corrupted persisted state. Never auto-repaired.
    pub fn state_corruption(path: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::fatal(
            ErrorCode::StateCorruption,
            format!("persisted state is unreadable: {}", reason),
        )
        .with_context("path", path.to_string())
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Attach the owning project and step so the message is actionable on its own.
    pub fn at_step(self, project_id: &str, step_index: usize) -> Self {
        let mut err = self;
        err.context
            .entry("project_id".to_string())
            .or_insert_with(|| Value::String(project_id.to_string()));
        err.context
            .entry("step_index".to_string())
            .or_insert_with(|| Value::from(step_index));
        err
    }

    /// Convert an exhausted failure into a fatal one, keeping it as the cause.
    pub fn into_fatal(self, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut fatal = Self::fatal(code, message);
        fatal.retry_count = self.retry_count;
        fatal.context = self.context.clone();
        fatal.context.insert(
            "underlying_code".to_string(),
            Value::String(self.code.as_str().to_string()),
        );
        fatal.source = Some(Box::new(self));
        fatal
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Recoverable)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Retryable { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Fatal)
    }

    /// Retry ceiling declared by the error itself, if any.
    pub fn max_retries(&self) -> Option<u32> {
        match self.kind {
            ErrorKind::Retryable { max_retries } => max_retries,
            _ => None,
        }
    }

    /// Serializable snapshot for persisting alongside workflow state.
    pub fn record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind,
            code: self.code,
            message: self.to_string(),
            context: self.context.clone(),
            retry_count: self.retry_count,
            timestamp: self.timestamp,
        }
    }
}

/// Persisted form of a [`ClassifiedError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

pub type Result<T> = std::result::Result<T, ClassifiedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_disjoint() {
        let recoverable = ClassifiedError::recoverable(ErrorCode::LockContention, "busy");
        assert!(recoverable.is_recoverable());
        assert!(!recoverable.is_retryable());
        assert!(!recoverable.is_fatal());

        let retryable = ClassifiedError::retryable(ErrorCode::WorkerRateLimited, "429");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.max_retries(), None);
        assert_eq!(
            ClassifiedError::retryable_with(ErrorCode::WorkerRateLimited, "429", 1).max_retries(),
            Some(1)
        );

        let fatal = ClassifiedError::fatal(ErrorCode::WorkerAuth, "401");
        assert!(fatal.is_fatal());
        assert_eq!(fatal.max_retries(), None);
    }

    #[test]
    fn test_display_includes_location_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = ClassifiedError::fatal(ErrorCode::StateWrite, "failed to write state")
            .with_source(io)
            .at_step("proj-a", 4);

        let text = err.to_string();
        assert!(text.contains("[state_write]"));
        assert!(text.contains("project_id=proj-a"));
        assert!(text.contains("step_index=4"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn test_at_step_keeps_existing_context() {
        let err = ClassifiedError::fatal(ErrorCode::InvalidState, "bad")
            .with_context("step_index", 1)
            .at_step("p", 9);
        assert_eq!(err.context["step_index"], Value::from(1));
    }

    #[test]
    fn test_into_fatal_preserves_history() {
        let err = ClassifiedError::retryable(ErrorCode::WorkerUnavailable, "503")
            .with_context("retry_history", vec!["a", "b"])
            .with_retry_count(3);

        let fatal = err.into_fatal(ErrorCode::RetriesExhausted, "worker gave up");
        assert!(fatal.is_fatal());
        assert_eq!(fatal.retry_count, 3);
        assert!(fatal.context.contains_key("retry_history"));
        assert_eq!(fatal.context["underlying_code"], "worker_unavailable");
        assert!(fatal.to_string().contains("503"));
    }

    #[test]
    fn test_state_corruption_records_path() {
        let err = ClassifiedError::state_corruption("/tmp/state.json", "expected value");
        assert_eq!(err.code, ErrorCode::StateCorruption);
        assert!(err.is_fatal());
        assert_eq!(err.context["path"], "/tmp/state.json");
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let record = ClassifiedError::fatal(ErrorCode::StepLimitExceeded, "too many steps").record();
        let json = serde_json::to_string(&record).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}

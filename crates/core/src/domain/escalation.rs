use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorCode, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    #[default]
    Pending,
    Responded,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Resolved => "resolved",
        }
    }
}

/// Why the run was suspended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// Autonomous answer fell below the confidence threshold.
    Decision,
    /// Step flagged for confirmation while running attended.
    Confirmation,
    /// A worker call exhausted its retries.
    Failure,
}

impl EscalationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Confirmation => "confirmation",
            Self::Failure => "failure",
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A paused decision point awaiting a human response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Escalation {
    pub id: Uuid,
    pub project_id: String,
    pub workflow: String,
    pub step_index: usize,
    pub kind: EscalationKind,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// What the autonomous attempt concluded and why.
    #[serde(default)]
    pub reasoning: String,
    pub confidence: f64,
    pub status: EscalationStatus,
    pub priority: Priority,
    #[serde(default)]
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Escalation {
    pub fn new(
        project_id: impl Into<String>,
        workflow: impl Into<String>,
        step_index: usize,
        kind: EscalationKind,
        question: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            workflow: workflow.into(),
            step_index,
            kind,
            question: question.into(),
            options: Vec::new(),
            reasoning: String::new(),
            confidence: 0.0,
            status: EscalationStatus::Pending,
            priority: Priority::Normal,
            response: None,
            created_at: Utc::now(),
            responded_at: None,
            resolved_at: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>, confidence: f64) -> Self {
        self.reasoning = reasoning.into();
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status != EscalationStatus::Resolved
    }

    /// Record a human response.
    ///
    /// A resolved escalation can never be answered again. A responded one
    /// only accepts the answer it already holds, so an interrupted response
    /// can be repeated but not changed.
    pub fn respond(&mut self, response: impl Into<String>) -> Result<()> {
        let response = response.into();
        if self.status == EscalationStatus::Resolved {
            return Err(ClassifiedError::fatal(
                ErrorCode::EscalationAlreadyResolved,
                format!("escalation {} was already resolved", self.id),
            )
            .with_context("escalation_id", self.id)
            .at_step(&self.project_id, self.step_index));
        }
        if self.status == EscalationStatus::Responded {
            if let Some(existing) = self.response.as_deref().filter(|r| *r != response) {
                return Err(ClassifiedError::fatal(
                    ErrorCode::EscalationAlreadyAnswered,
                    format!(
                        "escalation {} was already answered with '{}'",
                        self.id, existing
                    ),
                )
                .with_context("escalation_id", self.id)
                .at_step(&self.project_id, self.step_index));
            }
        }
        self.status = EscalationStatus::Responded;
        self.response = Some(response);
        self.responded_at = Some(Utc::now());
        Ok(())
    }

    pub fn resolve(&mut self) -> Result<()> {
        if self.status != EscalationStatus::Responded {
            return Err(ClassifiedError::fatal(
                ErrorCode::InvalidState,
                format!(
                    "escalation {} cannot be resolved from status {}",
                    self.id,
                    self.status.as_str()
                ),
            ));
        }
        self.status = EscalationStatus::Resolved;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

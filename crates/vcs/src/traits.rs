use async_trait::async_trait;
use autopilot_core::WorkUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::ordering::dependency_order;

/// An isolated working copy for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Workspace {
    pub unit_id: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    #[cfg_attr(feature = "typescript", ts(type = "string"))]
    pub path: PathBuf,
    pub branch_name: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(unit_id: impl Into<String>, path: PathBuf, branch_name: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            path,
            branch_name: branch_name.into(),
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Proposed,
    Abandoned,
}

/// A unit's changes, committed and ready to be integrated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Integration {
    pub unit_id: String,
    pub branch_name: String,
    /// Commit the integration points at
    pub commit: String,
    pub proposed_at: DateTime<Utc>,
}

impl Integration {
    /// Stable reference recorded in workflow state
    pub fn reference(&self) -> String {
        format!("{}@{}", self.branch_name, self.commit)
    }
}

/// Trait for version control system operations
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Get the name of the VCS backend
    fn name(&self) -> &'static str;

    /// Check if the VCS is available (command exists)
    async fn is_available(&self) -> bool;

    /// Check if the repository is initialized with this VCS
    async fn is_initialized(&self) -> Result<bool>;

    /// Create an isolated workspace for a unit of work
    async fn create_workspace(&self, unit_id: &str) -> Result<Workspace>;

    /// Commit a workspace's changes and propose them for integration
    async fn propose_integration(&self, workspace: &Workspace, message: &str)
        -> Result<Integration>;

    /// Order units so every unit follows the units it depends on.
    ///
    /// Cycles and references to unknown units are errors.
    fn determine_order(&self, units: &[WorkUnit]) -> Result<Vec<WorkUnit>> {
        dependency_order(units)
    }

    /// Commit the given paths in the main working copy.
    ///
    /// Returns the new commit id, or `None` when nothing changed.
    async fn checkpoint(&self, paths: &[PathBuf], message: &str) -> Result<Option<String>>;

    /// Clean up and remove a workspace
    async fn cleanup_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// List all active workspaces
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;

    /// Get the main/default branch name
    fn main_branch(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_new() {
        let ws = Workspace::new("story-1", PathBuf::from("/tmp/ws"), "unit-story-1");

        assert_eq!(ws.unit_id, "story-1");
        assert_eq!(ws.path, PathBuf::from("/tmp/ws"));
        assert_eq!(ws.branch_name, "unit-story-1");
        assert_eq!(ws.status, WorkspaceStatus::Active);
    }

    #[test]
    fn test_integration_reference() {
        let integration = Integration {
            unit_id: "story-1".to_string(),
            branch_name: "unit-story-1".to_string(),
            commit: "abc123".to_string(),
            proposed_at: Utc::now(),
        };
        assert_eq!(integration.reference(), "unit-story-1@abc123");
    }

    #[test]
    fn test_workspace_status_serialization() {
        let json = serde_json::to_string(&WorkspaceStatus::Proposed).unwrap();
        assert_eq!(json, "\"proposed\"");
    }
}

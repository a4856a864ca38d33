use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, VcsError};
use crate::traits::{Integration, VersionControl, Workspace, WorkspaceStatus};

const UNIT_PREFIX: &str = "unit-";

/// Git backend: one worktree and branch per unit of work.
pub struct GitVcs {
    repo_path: PathBuf,
    workspace_base: PathBuf,
    main_branch: String,
}

impl GitVcs {
    pub fn new(repo_path: PathBuf, workspace_base: PathBuf) -> Self {
        Self {
            repo_path,
            workspace_base,
            main_branch: "main".to_string(),
        }
    }

    pub fn with_main_branch(mut self, branch: impl Into<String>) -> Self {
        self.main_branch = branch.into();
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<String> {
        debug!("Running git {:?} in {:?}", args, cwd);

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => VcsError::CommandNotFound("git".to_string()),
                _ => VcsError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::CommandFailed(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn workspace_path(&self, unit_id: &str) -> PathBuf {
        self.workspace_base.join(format!("{}{}", UNIT_PREFIX, unit_id))
    }

    fn branch_name(&self, unit_id: &str) -> String {
        format!("{}{}", UNIT_PREFIX, unit_id)
    }

    fn path_arg(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| VcsError::InvalidPath(path.display().to_string()))
    }

    async fn head(&self, cwd: &Path) -> Result<String> {
        let output = self.run_git(&["rev-parse", "HEAD"], cwd).await?;
        Ok(output.trim().to_string())
    }
}

/// Parse `git worktree list --porcelain` into unit workspaces.
fn parse_worktrees(output: &str) -> Vec<Workspace> {
    let mut workspaces = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    let mut flush = |path: Option<PathBuf>, branch: Option<String>| {
        if let (Some(path), Some(branch)) = (path, branch) {
            if let Some(unit_id) = branch.strip_prefix(UNIT_PREFIX) {
                let unit_id = unit_id.to_string();
                workspaces.push(Workspace::new(unit_id, path, branch));
            }
        }
    };

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(path));
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        } else if line.is_empty() {
            flush(current_path.take(), current_branch.take());
        }
    }
    flush(current_path, current_branch);

    workspaces
}

#[async_trait]
impl VersionControl for GitVcs {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn is_initialized(&self) -> Result<bool> {
        let git_dir = self.repo_path.join(".git");
        Ok(git_dir.exists())
    }

    async fn create_workspace(&self, unit_id: &str) -> Result<Workspace> {
        if !self.is_initialized().await? {
            return Err(VcsError::NotInitialized(
                self.repo_path.display().to_string(),
            ));
        }

        let workspace_path = self.workspace_path(unit_id);
        let branch = self.branch_name(unit_id);

        if workspace_path.exists() {
            return Err(VcsError::WorkspaceAlreadyExists(unit_id.to_string()));
        }

        self.run_git(
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                Self::path_arg(&workspace_path)?,
                &self.main_branch,
            ],
            &self.repo_path,
        )
        .await?;

        info!(unit_id = %unit_id, branch = %branch, "Created unit workspace");
        Ok(Workspace::new(unit_id, workspace_path, branch))
    }

    async fn propose_integration(
        &self,
        workspace: &Workspace,
        message: &str,
    ) -> Result<Integration> {
        if !workspace.path.exists() {
            return Err(VcsError::WorkspaceNotFound(workspace.unit_id.clone()));
        }

        let status = self
            .run_git(&["status", "--porcelain"], &workspace.path)
            .await?;
        if !status.trim().is_empty() {
            self.run_git(&["add", "-A"], &workspace.path).await?;
            self.run_git(&["commit", "-m", message], &workspace.path)
                .await?;
        }

        let commit = self.head(&workspace.path).await?;
        info!(
            unit_id = %workspace.unit_id,
            branch = %workspace.branch_name,
            commit = %commit,
            "Proposed unit for integration"
        );

        Ok(Integration {
            unit_id: workspace.unit_id.clone(),
            branch_name: workspace.branch_name.clone(),
            commit,
            proposed_at: Utc::now(),
        })
    }

    async fn checkpoint(&self, paths: &[PathBuf], message: &str) -> Result<Option<String>> {
        if paths.is_empty() {
            return Ok(None);
        }

        let mut args = vec!["add", "--"];
        for path in paths {
            args.push(Self::path_arg(path)?);
        }
        self.run_git(&args, &self.repo_path).await?;

        let mut status_args = vec!["status", "--porcelain", "--"];
        status_args.extend_from_slice(&args[2..]);
        let status = self.run_git(&status_args, &self.repo_path).await?;
        if status.trim().is_empty() {
            return Ok(None);
        }

        let mut commit_args = vec!["commit", "-m", message, "--"];
        commit_args.extend_from_slice(&args[2..]);
        self.run_git(&commit_args, &self.repo_path).await?;

        let commit = self.head(&self.repo_path).await?;
        debug!(commit = %commit, "Checkpointed state");
        Ok(Some(commit))
    }

    async fn cleanup_workspace(&self, workspace: &Workspace) -> Result<()> {
        if let Ok(path) = Self::path_arg(&workspace.path) {
            let _ = self
                .run_git(&["worktree", "remove", "--force", path], &self.repo_path)
                .await;
        }

        // Proposed branches carry the unit's commits and stay for integration.
        if workspace.status != WorkspaceStatus::Proposed {
            let _ = self
                .run_git(&["branch", "-D", &workspace.branch_name], &self.repo_path)
                .await;
        }

        if workspace.path.exists() {
            tokio::fs::remove_dir_all(&workspace.path).await?;
        }

        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let output = self
            .run_git(&["worktree", "list", "--porcelain"], &self.repo_path)
            .await?;

        Ok(parse_worktrees(&output))
    }

    fn main_branch(&self) -> &str {
        &self.main_branch
    }
}

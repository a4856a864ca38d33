//! State Store
//!
//! Crash-durable workflow state with an in-memory read cache.
//!
//! File structure, per project under the store root:
//! ```text
//! <root>/<project>/
//! ├── state.json             # Machine-readable WorkflowState
//! ├── status.md              # Human-readable summary, same revision
//! ├── escalations/<id>.json  # One document per escalation
//! └── archive/*.json         # Completed runs
//! ```
//!
//! Every write goes to a sibling temporary file first and is renamed into
//! place, so a crash never leaves a final file partially written.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autopilot_core::{Escalation, Phase, RunStatus, UnitProgress, WorkerActivity, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vcs::VersionControl;

use crate::error::{
    io_error, serialization_error, state_write_error, ClassifiedError, ErrorCode, Result,
};
use crate::status_doc::render_status;

const STATE_FILE: &str = "state.json";
const STATUS_FILE: &str = "status.md";
const ESCALATIONS_DIR: &str = "escalations";
const ARCHIVE_DIR: &str = "archive";

/// Read-only views served to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Summary,
    RecentActivity(usize),
    Units,
    Escalations,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StateSummary {
    pub project_id: String,
    pub workflow: String,
    pub workflow_name: String,
    pub phase: Phase,
    pub current_step: usize,
    pub total_steps: usize,
    pub status: RunStatus,
    pub pending_escalation: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowState> for StateSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            project_id: state.project_id.clone(),
            workflow: state.workflow.clone(),
            workflow_name: state.workflow_name.clone(),
            phase: state.phase,
            current_step: state.current_step,
            total_steps: state.total_steps,
            status: state.status,
            pending_escalation: state.pending_escalation.as_ref().map(|p| p.escalation_id),
            updated_at: state.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "projection", rename_all = "snake_case")]
pub enum StateView {
    Summary(StateSummary),
    RecentActivity { activity: Vec<WorkerActivity> },
    Units { units: Vec<UnitProgress> },
    Escalations { escalations: Vec<Escalation> },
    Full(Box<WorkflowState>),
}

#[derive(Debug, Default)]
struct EscalationCache {
    /// Whether every escalation on disk has been read.
    complete: bool,
    items: BTreeMap<Uuid, Escalation>,
}

/// Durable, cached store of workflow state and escalations.
pub struct StateStore {
    root: PathBuf,
    states: RwLock<HashMap<String, WorkflowState>>,
    escalations: RwLock<HashMap<String, EscalationCache>>,
    checkpoints: Option<Arc<dyn VersionControl>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("root", &self.root)
            .field("checkpoints", &self.checkpoints.as_ref().map(|v| v.name()))
            .finish()
    }
}

impl StateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            states: RwLock::new(HashMap::new()),
            escalations: RwLock::new(HashMap::new()),
            checkpoints: None,
        }
    }

    /// Commit state files to version control after every save.
    pub fn with_checkpoints(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.checkpoints = Some(vcs);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    pub fn state_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(STATE_FILE)
    }

    pub fn status_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(STATUS_FILE)
    }

    fn escalations_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(ESCALATIONS_DIR)
    }

    pub fn escalation_path(&self, project_id: &str, id: Uuid) -> PathBuf {
        self.escalations_dir(project_id).join(format!("{}.json", id))
    }

    fn archive_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(ARCHIVE_DIR)
    }

    /// Persist both representations, then replace the cached copy.
    ///
    /// Either both files are renamed into place and the cache updated, or
    /// both documents keep their previous revision, the cache is untouched
    /// and a fatal error is returned.
    pub async fn save(&self, state: &WorkflowState) -> Result<()> {
        let project = state.project_id.as_str();
        validate_project_id(project)?;
        let state_path = self.state_path(project);
        let status_path = self.status_path(project);

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| serialization_error("workflow state", e))?;
        let status = render_status(state);

        ensure_dir(&self.project_dir(project)).await?;

        let state_tmp = temp_path(&state_path);
        let status_tmp = temp_path(&status_path);
        let written = tokio::try_join!(
            async {
                fs::write(&state_tmp, json.as_bytes())
                    .await
                    .map_err(|e| state_write_error(&state_tmp, e))
            },
            async {
                fs::write(&status_tmp, status.as_bytes())
                    .await
                    .map_err(|e| state_write_error(&status_tmp, e))
            },
        );
        if let Err(err) = written {
            discard(&[&state_tmp, &status_tmp]).await;
            return Err(err);
        }

        let previous = match read_optional(&state_path).await {
            Ok(previous) => previous,
            Err(err) => {
                discard(&[&state_tmp, &status_tmp]).await;
                return Err(err);
            }
        };
        if let Err(e) = fs::rename(&state_tmp, &state_path).await {
            discard(&[&state_tmp, &status_tmp]).await;
            return Err(state_write_error(&state_path, e));
        }
        if let Err(e) = fs::rename(&status_tmp, &status_path).await {
            discard(&[&status_tmp]).await;
            restore(&state_path, previous).await;
            return Err(state_write_error(&status_path, e));
        }

        self.states
            .write()
            .await
            .insert(project.to_string(), state.clone());

        debug!(
            project_id = %project,
            step = state.current_step,
            status = state.status.as_str(),
            "Saved workflow state"
        );

        self.checkpoint(state, vec![state_path, status_path]).await;
        Ok(())
    }

    async fn checkpoint(&self, state: &WorkflowState, paths: Vec<PathBuf>) {
        let Some(vcs) = &self.checkpoints else {
            return;
        };
        let message = format!(
            "autopilot({}): {} step {}/{} [{}]",
            state.project_id,
            state.workflow_name,
            state.current_step,
            state.total_steps,
            state.status.as_str()
        );
        match vcs.checkpoint(&paths, &message).await {
            Ok(Some(commit)) => {
                debug!(project_id = %state.project_id, commit = %commit, "State checkpoint committed")
            }
            Ok(None) => {}
            Err(e) => warn!(project_id = %state.project_id, "State checkpoint failed: {}", e),
        }
    }

    /// Load state from disk. `None` means the project has never run.
    pub async fn load(&self, project_id: &str) -> Result<Option<WorkflowState>> {
        validate_project_id(project_id)?;
        let path = self.state_path(project_id);
        let Some(content) = read_optional(&path).await? else {
            debug!(project_id = %project_id, "No state file found at {}", path.display());
            return Ok(None);
        };

        let state: WorkflowState = serde_json::from_str(&content)
            .map_err(|e| ClassifiedError::state_corruption(path.display(), e))?;

        self.states
            .write()
            .await
            .insert(project_id.to_string(), state.clone());

        info!(
            project_id = %project_id,
            step = state.current_step,
            status = state.status.as_str(),
            "Loaded workflow state"
        );
        Ok(Some(state))
    }

    /// Cached state, if any. Never touches disk.
    pub async fn cached(&self, project_id: &str) -> Option<WorkflowState> {
        self.states.read().await.get(project_id).cloned()
    }

    /// Cached state, falling back to disk.
    pub async fn current(&self, project_id: &str) -> Result<Option<WorkflowState>> {
        match self.cached(project_id).await {
            Some(state) => Ok(Some(state)),
            None => self.load(project_id).await,
        }
    }

    /// Serve a projection, reading from disk only on a cache miss.
    pub async fn query(&self, project_id: &str, projection: Projection) -> Result<Option<StateView>> {
        if projection == Projection::Escalations {
            let escalations = self.list_escalations(project_id).await?;
            return Ok(Some(StateView::Escalations { escalations }));
        }

        let Some(state) = self.current(project_id).await? else {
            return Ok(None);
        };

        let view = match projection {
            Projection::Summary => StateView::Summary(StateSummary::from(&state)),
            Projection::RecentActivity(limit) => StateView::RecentActivity {
                activity: state.recent_activity(limit).to_vec(),
            },
            Projection::Units => StateView::Units {
                units: state.units.values().cloned().collect(),
            },
            Projection::Full | Projection::Escalations => StateView::Full(Box::new(state)),
        };
        Ok(Some(view))
    }

    /// Copy a finished state into the project archive.
    pub async fn archive(&self, state: &WorkflowState) -> Result<PathBuf> {
        validate_project_id(&state.project_id)?;
        let dir = self.archive_dir(&state.project_id);
        ensure_dir(&dir).await?;

        let stamp = state
            .completed_at
            .unwrap_or_else(Utc::now)
            .format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("{}-{}.json", stamp, slug(&state.workflow_name)));
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| serialization_error("archived state", e))?;
        write_atomic(&path, json.as_bytes()).await?;

        info!(project_id = %state.project_id, path = %path.display(), "Archived workflow state");
        Ok(path)
    }

    /// Variables from every archived run, oldest first, later runs winning.
    pub async fn archived_variables(&self, project_id: &str) -> Result<BTreeMap<String, Value>> {
        validate_project_id(project_id)?;
        let dir = self.archive_dir(project_id);
        let mut files = json_files(&dir).await?;
        files.sort();

        let mut variables = BTreeMap::new();
        for path in files {
            let Some(content) = read_optional(&path).await? else {
                continue;
            };
            let archived: WorkflowState = serde_json::from_str(&content)
                .map_err(|e| ClassifiedError::state_corruption(path.display(), e))?;
            variables.extend(archived.variables);
        }
        Ok(variables)
    }

    pub async fn save_escalation(&self, escalation: &Escalation) -> Result<()> {
        let project = escalation.project_id.as_str();
        validate_project_id(project)?;
        let path = self.escalation_path(project, escalation.id);
        ensure_dir(&self.escalations_dir(project)).await?;

        let json = serde_json::to_string_pretty(escalation)
            .map_err(|e| serialization_error("escalation", e))?;
        write_atomic(&path, json.as_bytes()).await?;

        self.escalations
            .write()
            .await
            .entry(project.to_string())
            .or_default()
            .items
            .insert(escalation.id, escalation.clone());

        debug!(
            project_id = %project,
            escalation_id = %escalation.id,
            status = escalation.status.as_str(),
            "Saved escalation"
        );
        Ok(())
    }

    pub async fn load_escalation(&self, project_id: &str, id: Uuid) -> Result<Option<Escalation>> {
        validate_project_id(project_id)?;
        if let Some(found) = self
            .escalations
            .read()
            .await
            .get(project_id)
            .and_then(|cache| cache.items.get(&id))
        {
            return Ok(Some(found.clone()));
        }

        let path = self.escalation_path(project_id, id);
        let Some(content) = read_optional(&path).await? else {
            return Ok(None);
        };
        let escalation: Escalation = serde_json::from_str(&content)
            .map_err(|e| ClassifiedError::state_corruption(path.display(), e))?;

        self.escalations
            .write()
            .await
            .entry(project_id.to_string())
            .or_default()
            .items
            .insert(id, escalation.clone());
        Ok(Some(escalation))
    }

    /// Find an escalation by identity alone, searching every project.
    pub async fn find_escalation(&self, id: Uuid) -> Result<Option<Escalation>> {
        let cached = self
            .escalations
            .read()
            .await
            .values()
            .find_map(|cache| cache.items.get(&id).cloned());
        if cached.is_some() {
            return Ok(cached);
        }

        for project in self.projects().await? {
            if let Some(found) = self.load_escalation(&project, id).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// All escalations of a project, oldest first.
    pub async fn list_escalations(&self, project_id: &str) -> Result<Vec<Escalation>> {
        validate_project_id(project_id)?;
        let complete = self
            .escalations
            .read()
            .await
            .get(project_id)
            .map(|cache| cache.complete)
            .unwrap_or(false);

        if !complete {
            let mut loaded = BTreeMap::new();
            for path in json_files(&self.escalations_dir(project_id)).await? {
                let Some(content) = read_optional(&path).await? else {
                    continue;
                };
                let escalation: Escalation = serde_json::from_str(&content)
                    .map_err(|e| ClassifiedError::state_corruption(path.display(), e))?;
                loaded.insert(escalation.id, escalation);
            }

            let mut caches = self.escalations.write().await;
            let cache = caches.entry(project_id.to_string()).or_default();
            // Entries saved since are newer than what was just read.
            for (id, escalation) in loaded {
                cache.items.entry(id).or_insert(escalation);
            }
            cache.complete = true;
        }

        let caches = self.escalations.read().await;
        let mut escalations: Vec<Escalation> = caches
            .get(project_id)
            .map(|cache| cache.items.values().cloned().collect())
            .unwrap_or_default();
        escalations.sort_by_key(|e| e.created_at);
        Ok(escalations)
    }

    /// Projects with a directory under the store root.
    pub async fn projects(&self) -> Result<Vec<String>> {
        let mut projects = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(projects),
            Err(e) => return Err(io_error("list", &self.root, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && validate_project_id(&name).is_ok() {
                projects.push(name);
            }
        }
        projects.sort();
        Ok(projects)
    }
}

/// Project ids name a directory directly under the store root.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let valid = !project_id.is_empty()
        && !project_id.starts_with('.')
        && !project_id.contains(['/', '\\', '\0']);
    if valid {
        return Ok(());
    }
    Err(ClassifiedError::fatal(
        ErrorCode::InvalidProjectId,
        format!("'{}' is not a valid project id", project_id),
    )
    .with_context("project_id", project_id))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write to a sibling temporary file, then rename into place.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    fs::write(&tmp, content)
        .await
        .map_err(|e| state_write_error(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(state_write_error(path, e));
    }
    Ok(())
}

/// Best-effort removal of temporaries a failed save left behind.
async fn discard(paths: &[&Path]) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

/// Put back the state document a failed save had already replaced.
async fn restore(path: &Path, previous: Option<String>) {
    let restored = match previous {
        Some(content) => write_atomic(path, content.as_bytes()).await,
        None => fs::remove_file(path)
            .await
            .map_err(|e| io_error("remove", path, e)),
    };
    if let Err(err) = restored {
        error!(path = %path.display(), "Failed to restore previous state: {}", err);
    }
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| state_write_error(dir, e))
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

/// `*.json` files in a directory, ignoring temporaries. Missing directory is empty.
async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(io_error("list", dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("list", dir, e))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && name.ends_with(".json") {
            files.push(path);
        }
    }
    Ok(files)
}

fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "workflow".to_string()
    } else {
        slug
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use autopilot_core::WorkflowDefinition;
use orchestrator::{
    ClassifiedError, Decision, DecisionPolicy, DecisionRequest, DecisionSource, ErrorCode,
    EscalationQueue, FileTemplateRenderer, Interpreter, InterpreterConfig, Result, RetryPolicy,
    StateStore, WorkerContext, WorkerOutput, WorkerPool,
};
use serde_json::Value;
use tempfile::TempDir;
use vcs::{Integration, VersionControl, Workspace, WorkspaceStatus};

/// What a scripted worker does on one call.
pub enum Reply {
    Ok(WorkerOutput),
    Unavailable,
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub role: String,
    pub task: String,
    pub workspace: Option<PathBuf>,
    pub unit: Option<String>,
}

/// Replies per role in order; an exhausted script answers with an empty output.
#[derive(Default)]
pub struct ScriptedWorkers {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedWorkers {
    pub fn script(&self, role: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(role.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerPool for ScriptedWorkers {
    async fn invoke(&self, role: &str, task: &str, context: &WorkerContext) -> Result<WorkerOutput> {
        self.calls.lock().unwrap().push(Call {
            role: role.to_string(),
            task: task.to_string(),
            workspace: context.workspace().map(Path::to_path_buf),
            unit: context.unit().map(|u| u.id.clone()),
        });

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(role)
            .and_then(VecDeque::pop_front);
        match reply {
            None => Ok(WorkerOutput::default()),
            Some(Reply::Ok(output)) => Ok(output),
            Some(Reply::Unavailable) => Err(ClassifiedError::retryable(
                ErrorCode::WorkerUnavailable,
                format!("worker '{}' is overloaded", role),
            )),
            Some(Reply::Unauthorized) => Err(ClassifiedError::fatal(
                ErrorCode::WorkerAuth,
                format!("worker '{}' rejected the credentials", role),
            )),
        }
    }
}

/// Always suggests the same answer with the same confidence.
pub struct FixedPolicy {
    pub answer: String,
    pub confidence: f64,
}

impl FixedPolicy {
    pub fn new(answer: &str, confidence: f64) -> Self {
        Self {
            answer: answer.to_string(),
            confidence,
        }
    }
}

#[async_trait]
impl DecisionPolicy for FixedPolicy {
    async fn decide(&self, _request: &DecisionRequest) -> Result<Decision> {
        Ok(Decision::new(&self.answer, self.confidence, DecisionSource::Guidance)
            .with_reasoning("fixed"))
    }
}

/// Hands out directories under a temp root and records integrations and
/// cleanups in order.
pub struct FakeVcs {
    root: PathBuf,
    pub integrated: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<(String, WorkspaceStatus)>>,
}

impl FakeVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            integrated: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn is_initialized(&self) -> vcs::Result<bool> {
        Ok(true)
    }

    async fn create_workspace(&self, unit_id: &str) -> vcs::Result<Workspace> {
        let path = self.root.join(unit_id);
        std::fs::create_dir_all(&path)?;
        Ok(Workspace::new(unit_id, path, format!("unit-{}", unit_id)))
    }

    async fn propose_integration(&self, workspace: &Workspace, _message: &str) -> vcs::Result<Integration> {
        self.integrated
            .lock()
            .unwrap()
            .push(workspace.unit_id.clone());
        Ok(Integration {
            unit_id: workspace.unit_id.clone(),
            branch_name: workspace.branch_name.clone(),
            commit: "abc123".to_string(),
            proposed_at: chrono::Utc::now(),
        })
    }

    async fn checkpoint(&self, _paths: &[PathBuf], _message: &str) -> vcs::Result<Option<String>> {
        Ok(None)
    }

    async fn cleanup_workspace(&self, workspace: &Workspace) -> vcs::Result<()> {
        self.cleaned
            .lock()
            .unwrap()
            .push((workspace.unit_id.clone(), workspace.status));
        if workspace.path.exists() {
            std::fs::remove_dir_all(&workspace.path)?;
        }
        Ok(())
    }

    async fn list_workspaces(&self) -> vcs::Result<Vec<Workspace>> {
        Ok(Vec::new())
    }

    fn main_branch(&self) -> &str {
        "main"
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<StateStore>,
    pub workers: Arc<ScriptedWorkers>,
    pub vcs: Arc<FakeVcs>,
    pub interpreter: Interpreter,
}

impl Harness {
    pub fn new(policy: FixedPolicy) -> Self {
        Self::with_config(policy, |config| config)
    }

    pub fn with_config(
        policy: FixedPolicy,
        configure: impl FnOnce(InterpreterConfig) -> InterpreterConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let workers = Arc::new(ScriptedWorkers::default());
        let vcs = Arc::new(FakeVcs::new(&dir.path().join("workspaces")));
        let interpreter = build(dir.path(), workers.clone(), vcs.clone(), policy, configure);
        let store = interpreter.store().clone();
        Self {
            dir,
            store,
            workers,
            vcs,
            interpreter,
        }
    }

    /// A second interpreter over the same directory, as after a process restart.
    pub fn restart(&self, policy: FixedPolicy) -> Interpreter {
        build(
            self.dir.path(),
            self.workers.clone(),
            self.vcs.clone(),
            policy,
            |config| config,
        )
    }

    pub fn artifacts(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }
}

fn build(
    root: &Path,
    workers: Arc<ScriptedWorkers>,
    vcs: Arc<FakeVcs>,
    policy: FixedPolicy,
    configure: impl FnOnce(InterpreterConfig) -> InterpreterConfig,
) -> Interpreter {
    let templates = root.join("templates");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::write(templates.join("summary.md"), "# ${project}\n\nDatabase: ${database}\n").unwrap();

    let store = Arc::new(StateStore::new(root.join(".autopilot")));
    let queue = Arc::new(EscalationQueue::new(store.clone()));
    let config = configure(
        InterpreterConfig::default()
            .with_retry_policy(RetryPolicy::immediate(3))
            .with_artifacts_dir(root.join("artifacts")),
    );
    Interpreter::new(config, store, workers, Arc::new(policy), queue)
        .with_renderer(Arc::new(FileTemplateRenderer::new(templates)))
        .with_vcs(vcs)
}

pub fn output(name: &str, value: Value) -> WorkerOutput {
    WorkerOutput::default().with_variable(name, value)
}

pub fn workflow(yaml: &str) -> WorkflowDefinition {
    WorkflowDefinition::from_yaml(yaml).unwrap()
}

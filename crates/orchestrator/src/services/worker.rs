//! Worker pool collaborator.
//!
//! Workers are opaque to the interpreter: a role, a task and a context go
//! in, a [`WorkerOutput`] or an already classified error comes out.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use autopilot_core::WorkUnit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{serialization_error, ClassifiedError, ErrorCode, Result};
use crate::template::{lookup, TemplateError, Variables};

/// Exit status for a temporary failure (`EX_TEMPFAIL`).
pub const EXIT_TEMPORARY: i32 = 75;
/// Exit status for a permission problem (`EX_NOPERM`).
pub const EXIT_PERMISSION: i32 = 77;

/// Fresh, immutable context for a single delegation.
///
/// Built from only the variables a step declares as inputs, so nothing
/// leaks from one step to the next.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerContext {
    project_id: String,
    workflow: String,
    step_index: usize,
    inputs: BTreeMap<String, Value>,
    params: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workspace: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<WorkUnit>,
}

impl WorkerContext {
    pub fn new(project_id: impl Into<String>, workflow: impl Into<String>, step_index: usize) -> Self {
        Self {
            project_id: project_id.into(),
            workflow: workflow.into(),
            step_index,
            inputs: BTreeMap::new(),
            params: BTreeMap::new(),
            workspace: None,
            unit: None,
        }
    }

    /// Copy the named variables in. A name that is not defined is an error.
    pub fn with_inputs(mut self, names: &[String], variables: &Variables) -> Result<Self> {
        for name in names {
            let value = lookup(variables, name)
                .ok_or_else(|| TemplateError::UndefinedVariable(name.clone()))?;
            self.inputs.insert(name.clone(), value.clone());
        }
        Ok(self)
    }

    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_unit(mut self, unit: WorkUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn unit(&self) -> Option<&WorkUnit> {
        self.unit.as_ref()
    }
}

/// What a worker hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Variables merged into the workflow state.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Set by decision workers.
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl WorkerOutput {
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn answer(answer: impl Into<String>, confidence: f64) -> Self {
        Self {
            answer: Some(answer.into()),
            confidence: Some(confidence),
            ..Default::default()
        }
    }
}

/// Pool of workers addressed by role.
///
/// Implementations translate provider-specific failures into classified
/// errors; the interpreter never inspects them further.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn invoke(&self, role: &str, task: &str, context: &WorkerContext) -> Result<WorkerOutput>;
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    role: &'a str,
    task: &'a str,
    context: &'a WorkerContext,
}

/// Runs one external command per role.
///
/// The request goes to stdin as JSON and a JSON [`WorkerOutput`] is read
/// from stdout. The command runs inside the unit workspace when there is one.
#[derive(Debug, Clone)]
pub struct CommandWorkerPool {
    commands: HashMap<String, Vec<String>>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandWorkerPool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands: HashMap::new(),
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    pub fn with_command(mut self, role: impl Into<String>, argv: Vec<String>) -> Self {
        self.commands.insert(role.into(), argv);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

#[async_trait]
impl WorkerPool for CommandWorkerPool {
    async fn invoke(&self, role: &str, task: &str, context: &WorkerContext) -> Result<WorkerOutput> {
        let argv = self
            .commands
            .get(role)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                ClassifiedError::fatal(
                    ErrorCode::MissingCollaborator,
                    format!("no worker command configured for role '{}'", role),
                )
                .with_context("role", role)
            })?;

        let cwd = context.workspace().unwrap_or(self.working_dir.as_path());
        debug!(role = %role, command = ?argv, cwd = %cwd.display(), "Invoking worker");

        let request = serde_json::to_vec(&WorkerRequest {
            role,
            task,
            context,
        })
        .map_err(|e| serialization_error("worker request", e))?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let err = if e.kind() == std::io::ErrorKind::NotFound {
                    ClassifiedError::fatal(
                        ErrorCode::MissingCollaborator,
                        format!("worker command '{}' not found", argv[0]),
                    )
                } else {
                    ClassifiedError::retryable(
                        ErrorCode::WorkerUnavailable,
                        format!("failed to start worker '{}': {}", argv[0], e),
                    )
                };
                err.with_context("role", role).with_source(e)
            })?;

        // Fed from its own task so a worker that writes before it finishes
        // reading can never block on a full pipe.
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&request).await,
                None => Ok(()),
            }
        });

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(output) => output,
                Err(_) => {
                    writer.abort();
                    return Err(ClassifiedError::retryable(
                        ErrorCode::WorkerTimeout,
                        format!("worker '{}' timed out after {}s", role, limit.as_secs()),
                    )
                    .with_context("role", role));
                }
            },
            None => waited.await,
        }
        .map_err(|e| {
            ClassifiedError::retryable(
                ErrorCode::WorkerUnavailable,
                format!("worker '{}' could not be awaited: {}", role, e),
            )
            .with_source(e)
        })?;

        let written = writer.await.map_err(|e| {
            ClassifiedError::retryable(
                ErrorCode::WorkerUnavailable,
                format!("writing the request to worker '{}' was interrupted: {}", role, e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(role, output.status.code(), stderr.trim()));
        }

        match written {
            Ok(()) => {}
            // The worker finished without reading all of its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(role = %role, "Worker closed its input early");
            }
            Err(e) => {
                return Err(ClassifiedError::retryable(
                    ErrorCode::WorkerUnavailable,
                    format!("failed to send the request to worker '{}': {}", role, e),
                )
                .with_context("role", role)
                .with_source(e));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_output(role, stdout.trim())?;
        info!(role = %role, step = context.step_index(), "Worker finished");
        Ok(parsed)
    }
}

fn parse_output(role: &str, stdout: &str) -> Result<WorkerOutput> {
    if stdout.is_empty() {
        return Ok(WorkerOutput::default());
    }
    serde_json::from_str(stdout).map_err(|e| {
        ClassifiedError::fatal(
            ErrorCode::WorkerFailed,
            format!("worker '{}' produced malformed output: {}", role, e),
        )
        .with_context("role", role)
    })
}

/// Map a failed worker exit onto the error taxonomy.
///
/// Status codes in stderr only count as whole tokens, so "5003 files" is
/// not a server error.
pub fn classify_exit(role: &str, code: Option<i32>, stderr: &str) -> ClassifiedError {
    let lower = stderr.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let has = |markers: &[&'static str]| markers.iter().any(|m| tokens.contains(m));
    let message = format!(
        "worker '{}' exited with {}: {}",
        role,
        code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        stderr
    );

    let err = match code {
        Some(EXIT_PERMISSION) => ClassifiedError::fatal(ErrorCode::WorkerAuth, message),
        _ if has(&["401", "403", "unauthorized", "forbidden"]) => {
            ClassifiedError::fatal(ErrorCode::WorkerAuth, message)
        }
        _ if has(&["429"]) || lower.contains("rate limit") => {
            ClassifiedError::retryable(ErrorCode::WorkerRateLimited, message)
        }
        Some(EXIT_TEMPORARY) => ClassifiedError::retryable(ErrorCode::WorkerUnavailable, message),
        _ if has(&["500", "502", "503", "504", "overloaded"]) => {
            ClassifiedError::retryable(ErrorCode::WorkerUnavailable, message)
        }
        _ => ClassifiedError::fatal(ErrorCode::WorkerFailed, message),
    };
    err.with_context("role", role).with_context("exit_code", code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn context() -> WorkerContext {
        WorkerContext::new("acme", "impl.yaml", 2)
    }

    #[test]
    fn test_context_copies_only_declared_inputs() {
        let mut vars = Variables::new();
        vars.insert("database".into(), json!("postgres"));
        vars.insert("secret".into(), json!("hunter2"));

        let ctx = context()
            .with_inputs(&["database".to_string()], &vars)
            .unwrap();
        assert_eq!(ctx.inputs().len(), 1);
        assert_eq!(ctx.inputs()["database"], "postgres");
    }

    #[test]
    fn test_context_missing_input_is_fatal() {
        let err: ClassifiedError = context()
            .with_inputs(&["nope".to_string()], &Variables::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::UndefinedVariable);
    }

    #[test]
    fn test_classify_exit() {
        assert!(classify_exit("dev", Some(EXIT_TEMPORARY), "").is_retryable());
        assert_eq!(
            classify_exit("dev", Some(EXIT_PERMISSION), "").code,
            ErrorCode::WorkerAuth
        );
        assert_eq!(
            classify_exit("dev", Some(1), "HTTP 429 Too Many Requests").code,
            ErrorCode::WorkerRateLimited
        );
        assert!(classify_exit("dev", Some(1), "upstream returned 503").is_retryable());
        assert!(classify_exit("dev", Some(1), "401 Unauthorized").is_fatal());
        assert!(classify_exit("dev", Some(2), "syntax error").is_fatal());
    }

    #[test]
    fn test_status_codes_match_whole_tokens() {
        let err = classify_exit("dev", Some(1), "wrote 5003 files before failing");
        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::WorkerFailed);
        assert_eq!(
            classify_exit("dev", Some(1), "request forbidden by policy").code,
            ErrorCode::WorkerAuth
        );
        assert!(classify_exit("dev", Some(1), "gateway said: 502").is_retryable());
    }

    #[tokio::test]
    async fn test_command_worker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CommandWorkerPool::new(dir.path()).with_command(
            "dev",
            sh(r#"cat > request.json; echo '{"variables":{"done":true},"output_ref":"request.json"}'"#),
        );

        let output = pool.invoke("dev", "build it", &context()).await.unwrap();
        assert_eq!(output.variables["done"], true);
        assert_eq!(output.output_ref.as_deref(), Some("request.json"));

        let request: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("request.json")).unwrap())
                .unwrap();
        assert_eq!(request["task"], "build it");
        assert_eq!(request["context"]["step_index"], 2);
    }

    #[tokio::test]
    async fn test_command_worker_temporary_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CommandWorkerPool::new(dir.path())
            .with_command("dev", sh("cat >/dev/null; echo busy >&2; exit 75"));

        let err = pool.invoke("dev", "t", &context()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code, ErrorCode::WorkerUnavailable);
    }

    #[tokio::test]
    async fn test_command_worker_malformed_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            CommandWorkerPool::new(dir.path()).with_command("dev", sh("cat >/dev/null; echo nope"));

        let err = pool.invoke("dev", "t", &context()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_large_request_with_chatty_worker_completes() {
        let dir = tempfile::tempdir().unwrap();
        // Fills the stderr pipe before reading any input.
        let pool = CommandWorkerPool::new(dir.path())
            .with_command(
                "dev",
                sh("head -c 200000 /dev/zero | tr '\\0' x >&2; cat >/dev/null; echo '{}'"),
            )
            .with_timeout(Duration::from_secs(30));

        let task = "x".repeat(1 << 20);
        let output = pool.invoke("dev", &task, &context()).await.unwrap();
        assert!(output.variables.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_role_is_fatal() {
        let pool = CommandWorkerPool::new(".");
        let err = pool.invoke("ghost", "t", &context()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingCollaborator);
    }
}

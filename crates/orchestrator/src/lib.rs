pub mod decision;
pub mod error;
pub mod escalation;
pub mod interpreter;
pub mod retry;
pub mod services;
pub mod state_machine;
pub mod state_store;
pub mod status_doc;
pub mod template;

pub use decision::{
    Decision, DecisionPolicy, DecisionRequest, DecisionSource, GuidanceDocument,
    GuidanceFirstPolicy,
};
pub use error::{ClassifiedError, ErrorCode, ErrorKind, Result};
pub use escalation::{
    EscalationNotifier, EscalationQueue, EventBusNotifier, ResumeTarget, TracingNotifier,
};
pub use interpreter::{Interpreter, InterpreterConfig, PauseHandle, RunOutcome};
pub use retry::{execute_recoverable, execute_with_retry, RetryPolicy};
pub use services::{
    CommandWorkerPool, FileTemplateRenderer, Renderer, WorkerContext, WorkerOutput, WorkerPool,
};
pub use state_machine::RunStateMachine;
pub use state_store::{Projection, StateStore, StateSummary, StateView};
pub use status_doc::render_status;
pub use template::Variables;

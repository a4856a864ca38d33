pub mod escalation;
pub mod state;
pub mod unit;
pub mod workflow;

pub use escalation::{Escalation, EscalationKind, EscalationStatus, Priority};
pub use state::{
    ActivityOutcome, PendingEscalation, RunStatus, UnitProgress, UnitStatus, WorkerActivity,
    WorkflowState,
};
pub use unit::WorkUnit;
pub use workflow::{
    ActionStep, ArtifactStep, DecisionStep, DelegateStep, JumpStep, Phase, Step, StepKind,
    StepRef, WorkflowDefinition,
};

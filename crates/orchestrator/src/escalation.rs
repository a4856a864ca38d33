//! Durable queue of questions the autopilot could not answer alone.
//!
//! Every escalation is persisted before anyone is told about it, and a
//! response is applied to its run exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use autopilot_core::{Escalation, EscalationStatus};
use events::{Event, EventBus};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorCode, Result};
use crate::interpreter::RunOutcome;
use crate::state_store::StateStore;

/// Told about escalations as they are created and resolved.
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify_created(&self, escalation: &Escalation);

    async fn notify_resolved(&self, _escalation: &Escalation) {}
}

/// Publishes escalation events on an [`EventBus`].
#[derive(Debug, Clone)]
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EscalationNotifier for EventBusNotifier {
    async fn notify_created(&self, escalation: &Escalation) {
        self.bus.emit(Event::EscalationCreated {
            project_id: escalation.project_id.clone(),
            escalation_id: escalation.id,
            step: escalation.step_index,
            question: escalation.question.clone(),
            priority: escalation.priority.as_str().to_string(),
        });
    }

    async fn notify_resolved(&self, escalation: &Escalation) {
        self.bus.emit(Event::EscalationResolved {
            project_id: escalation.project_id.clone(),
            escalation_id: escalation.id,
            response: escalation.response.clone().unwrap_or_default(),
        });
    }
}

/// Writes escalations to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl EscalationNotifier for TracingNotifier {
    async fn notify_created(&self, escalation: &Escalation) {
        warn!(
            project_id = %escalation.project_id,
            escalation_id = %escalation.id,
            step = escalation.step_index,
            kind = escalation.kind.as_str(),
            priority = escalation.priority.as_str(),
            "Escalation needs an answer: {}",
            escalation.question
        );
    }

    async fn notify_resolved(&self, escalation: &Escalation) {
        info!(
            project_id = %escalation.project_id,
            escalation_id = %escalation.id,
            "Escalation resolved"
        );
    }
}

/// The run an escalation belongs to.
#[async_trait]
pub trait ResumeTarget: Send + Sync {
    /// Whether the run is still parked on `escalation`.
    async fn awaits(&self, escalation: &Escalation) -> Result<bool>;

    /// Fold the answer into the run's persisted state without running further.
    /// Fails when the run is not parked on `escalation`.
    async fn apply_response(&self, escalation: &Escalation, response: &str) -> Result<()>;

    /// Pick the run up again once its escalation is resolved.
    async fn continue_run(&self, escalation: &Escalation) -> Result<RunOutcome>;
}

pub struct EscalationQueue {
    store: Arc<StateStore>,
    notifiers: Vec<Arc<dyn EscalationNotifier>>,
    responding: Mutex<()>,
}

impl EscalationQueue {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            notifiers: Vec::new(),
            responding: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Persist an escalation, then notify. Adding the same id twice is a no-op.
    pub async fn add(&self, escalation: &Escalation) -> Result<()> {
        if self
            .store
            .load_escalation(&escalation.project_id, escalation.id)
            .await?
            .is_some()
        {
            debug!(escalation_id = %escalation.id, "Escalation already queued");
            return Ok(());
        }

        self.store.save_escalation(escalation).await?;
        info!(
            project_id = %escalation.project_id,
            escalation_id = %escalation.id,
            kind = escalation.kind.as_str(),
            "Escalation queued"
        );

        for notifier in &self.notifiers {
            notifier.notify_created(escalation).await;
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Escalation> {
        self.store.find_escalation(id).await?.ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::EscalationNotFound,
                format!("no escalation with id {}", id),
            )
            .with_context("escalation_id", id)
        })
    }

    /// All escalations of a project, oldest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Escalation>> {
        self.store.list_escalations(project_id).await
    }

    /// Escalations still waiting on a resolution.
    pub async fn pending(&self, project_id: &str) -> Result<Vec<Escalation>> {
        Ok(self
            .list(project_id)
            .await?
            .into_iter()
            .filter(Escalation::is_open)
            .collect())
    }

    /// Answer an escalation and resume its run.
    ///
    /// The response is recorded first, then applied to the run, then the
    /// escalation is marked resolved. A failure in between leaves it
    /// `responded`, so the same call can be repeated with the same answer.
    /// A different answer, or any answer once resolved, is rejected, and so
    /// is a first answer to an escalation its run no longer waits on.
    pub async fn respond(
        &self,
        id: Uuid,
        response: &str,
        target: &dyn ResumeTarget,
    ) -> Result<RunOutcome> {
        let escalation = {
            let _guard = self.responding.lock().await;

            let mut escalation = self.get(id).await?;
            let retrying = escalation.status == EscalationStatus::Responded;
            escalation.respond(response)?;

            let waiting = target.awaits(&escalation).await?;
            if !waiting && !retrying {
                return Err(ClassifiedError::fatal(
                    ErrorCode::EscalationNotPending,
                    format!("the run of escalation {} is not waiting on it", id),
                )
                .with_context("escalation_id", id)
                .at_step(&escalation.project_id, escalation.step_index));
            }
            self.store.save_escalation(&escalation).await?;

            if waiting {
                target.apply_response(&escalation, response).await?;
            } else {
                debug!(escalation_id = %id, "Response already applied to the run");
            }

            escalation.resolve()?;
            self.store.save_escalation(&escalation).await?;
            escalation
        };

        info!(
            project_id = %escalation.project_id,
            escalation_id = %id,
            "Escalation answered"
        );
        for notifier in &self.notifiers {
            notifier.notify_resolved(&escalation).await;
        }

        target.continue_run(&escalation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::EscalationKind;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Recorder {
        applied: AtomicU32,
        continued: AtomicU32,
        fail_apply: bool,
        waiting: AtomicBool,
    }

    impl Default for Recorder {
        fn default() -> Self {
            Self {
                applied: AtomicU32::new(0),
                continued: AtomicU32::new(0),
                fail_apply: false,
                waiting: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ResumeTarget for Recorder {
        async fn awaits(&self, _escalation: &Escalation) -> Result<bool> {
            Ok(self.waiting.load(Ordering::SeqCst))
        }

        async fn apply_response(&self, _escalation: &Escalation, _response: &str) -> Result<()> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            if self.fail_apply {
                return Err(ClassifiedError::fatal(ErrorCode::InvalidResume, "boom"));
            }
            self.waiting.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn continue_run(&self, _escalation: &Escalation) -> Result<RunOutcome> {
            self.continued.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome::Completed)
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        created: AtomicU32,
        resolved: AtomicU32,
    }

    #[async_trait]
    impl EscalationNotifier for CountingNotifier {
        async fn notify_created(&self, _escalation: &Escalation) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        async fn notify_resolved(&self, _escalation: &Escalation) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (TempDir, EscalationQueue, Arc<CountingNotifier>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let notifier = Arc::new(CountingNotifier::default());
        let queue = EscalationQueue::new(store).with_notifier(notifier.clone());
        (dir, queue, notifier)
    }

    fn escalation() -> Escalation {
        Escalation::new("acme", "wf.yaml", 1, EscalationKind::Decision, "Which database?")
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (_dir, queue, notifier) = setup();
        let esc = escalation();

        queue.add(&esc).await.unwrap();
        queue.add(&esc).await.unwrap();

        assert_eq!(notifier.created.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending("acme").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_respond_resolves_once() {
        let (_dir, queue, notifier) = setup();
        let esc = escalation();
        queue.add(&esc).await.unwrap();
        let target = Recorder::default();

        let outcome = queue.respond(esc.id, "postgres", &target).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let stored = queue.get(esc.id).await.unwrap();
        assert_eq!(stored.status, EscalationStatus::Resolved);
        assert_eq!(stored.response.as_deref(), Some("postgres"));
        assert!(queue.pending("acme").await.unwrap().is_empty());

        let err = queue.respond(esc.id, "mysql", &target).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::EscalationAlreadyResolved);
        assert_eq!(target.applied.load(Ordering::SeqCst), 1);
        assert_eq!(target.continued.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.resolved.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_escalation_responded() {
        let (_dir, queue, _notifier) = setup();
        let esc = escalation();
        queue.add(&esc).await.unwrap();

        let failing = Recorder {
            fail_apply: true,
            ..Default::default()
        };
        assert!(queue.respond(esc.id, "postgres", &failing).await.is_err());
        assert_eq!(
            queue.get(esc.id).await.unwrap().status,
            EscalationStatus::Responded
        );

        let err = queue
            .respond(esc.id, "sqlite", &Recorder::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EscalationAlreadyAnswered);

        let target = Recorder::default();
        queue.respond(esc.id, "postgres", &target).await.unwrap();
        assert_eq!(
            queue.get(esc.id).await.unwrap().status,
            EscalationStatus::Resolved
        );
    }

    #[tokio::test]
    async fn test_repeated_response_skips_apply_when_run_moved_on() {
        let (_dir, queue, _notifier) = setup();
        let mut esc = escalation();
        esc.respond("postgres").unwrap();
        queue.add(&esc).await.unwrap();

        let target = Recorder::default();
        target.waiting.store(false, Ordering::SeqCst);
        queue.respond(esc.id, "postgres", &target).await.unwrap();

        assert_eq!(target.applied.load(Ordering::SeqCst), 0);
        assert_eq!(target.continued.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.get(esc.id).await.unwrap().status,
            EscalationStatus::Resolved
        );
    }

    #[tokio::test]
    async fn test_first_response_to_an_orphan_is_rejected() {
        let (_dir, queue, notifier) = setup();
        let esc = escalation();
        queue.add(&esc).await.unwrap();

        let target = Recorder::default();
        target.waiting.store(false, Ordering::SeqCst);
        let err = queue.respond(esc.id, "postgres", &target).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::EscalationNotPending);
        assert_eq!(target.applied.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.resolved.load(Ordering::SeqCst), 0);

        let stored = queue.get(esc.id).await.unwrap();
        assert_eq!(stored.status, EscalationStatus::Pending);
        assert!(stored.response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_escalation() {
        let (_dir, queue, _notifier) = setup();
        let err = queue
            .respond(Uuid::new_v4(), "x", &Recorder::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EscalationNotFound);
    }

    #[tokio::test]
    async fn test_event_bus_notifier() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let notifier = EventBusNotifier::new(bus);

        notifier.notify_created(&escalation()).await;
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::EscalationCreated { step: 1, .. }));
    }
}

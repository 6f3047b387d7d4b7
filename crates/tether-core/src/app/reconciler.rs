//! TerminationReconciler - Abort されたワークフローを終了させ続ける
//!
//! # 学習ポイント
//! - Abort 通知は「要求」として集合に積むだけ。実際の終了は周期的な sweep が行う
//! - エンジンが断ったら（false / Err / panic）集合に残して次の周期でやり直す
//! - biased select: キャンセルを最優先し、sweep の途中では止めない
//!
//! # ライフサイクル
//! ```text
//! Abort event ─▶ pending ─▶ sweep ─▶ terminate_workflow ─▶ true ─▶ removed
//!                   ▲                       │
//!                   └──── false / Err / panic
//! ```

use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::panic_message;
use crate::domain::events::StepErrorEvent;
use crate::domain::ids::WorkflowId;
use crate::ports::WorkflowEngine;

/// Workflows that still have to be terminated.
///
/// Safe to share between the event subscriber and the sweep.
#[derive(Debug, Default)]
pub struct PendingTerminations {
    ids: Mutex<BTreeSet<WorkflowId>>,
}

impl PendingTerminations {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, BTreeSet<WorkflowId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when `id` was not pending before.
    pub fn insert(&self, id: WorkflowId) -> bool {
        self.ids().insert(id)
    }

    pub fn remove(&self, id: &WorkflowId) -> bool {
        self.ids().remove(id)
    }

    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.ids().contains(id)
    }

    /// Copy of the current ids; the set may change while the copy is used.
    pub fn snapshot(&self) -> Vec<WorkflowId> {
        self.ids().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }
}

pub struct TerminationReconciler {
    engine: Arc<dyn WorkflowEngine>,
    pending: Arc<PendingTerminations>,
    interval: Duration,
}

impl TerminationReconciler {
    pub fn new(engine: Arc<dyn WorkflowEngine>, pending: Arc<PendingTerminations>, interval: Duration) -> Self {
        Self {
            engine,
            pending,
            interval,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTerminations> {
        &self.pending
    }

    /// Queue the workflow for termination if `event` is an abort.
    pub fn observe(&self, event: &StepErrorEvent) -> bool {
        if !event.is_abort() {
            debug!(workflow = %event.workflow_id, error = %event.error, "step error is not an abort");
            return false;
        }
        let added = self.pending.insert(event.workflow_id.clone());
        if added {
            info!(
                workflow = %event.workflow_id,
                step = event.step.id,
                reason = %event.error.message,
                "workflow aborted, termination pending"
            );
        }
        added
    }

    /// Try to terminate every pending workflow once; returns how many succeeded.
    ///
    /// Only a confirmed termination removes an id. Refusals, errors and
    /// panics from the engine leave it for the next sweep.
    pub async fn sweep(&self) -> usize {
        let mut terminated = 0;
        for id in self.pending.snapshot() {
            info!(workflow = %id, "attempting termination");
            let attempt = AssertUnwindSafe(self.engine.terminate_workflow(&id)).catch_unwind();
            match attempt.await {
                Ok(Ok(true)) => {
                    self.pending.remove(&id);
                    terminated += 1;
                    info!(workflow = %id, "workflow terminated");
                }
                Ok(Ok(false)) => warn!(workflow = %id, "engine declined termination, retrying"),
                Ok(Err(e)) => error!(workflow = %id, error = %e, "termination failed, retrying"),
                Err(panic) => error!(
                    workflow = %id,
                    panic = panic_message(&*panic),
                    "termination panicked, retrying"
                ),
            }
        }
        terminated
    }

    /// Subscribe to the engine's step errors and reconcile until `cancel`.
    pub async fn run(&self, cancel: CancellationToken) {
        self.run_with(self.engine.step_errors(), cancel).await;
    }

    /// Reconcile with an already-subscribed receiver until `cancel`.
    ///
    /// A sweep that has started always finishes before the loop exits.
    /// The receiver is dropped on exit, which unsubscribes from the engine.
    pub async fn run_with(&self, mut errors: broadcast::Receiver<StepErrorEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;
        info!(interval_ms = self.interval.as_millis() as u64, "termination reconciler started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = errors.recv(), if listening => match received {
                    Ok(event) => {
                        self.observe(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "step error events lost, some aborts may be missed");
                    }
                    Err(RecvError::Closed) => {
                        warn!("engine closed its step error stream");
                        listening = false;
                    }
                },

                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.sweep().await;
                    }
                }
            }
        }

        drop(errors);
        info!(pending = self.pending.len(), "termination reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::EngineError;
    use crate::domain::events::{StepError, StepInfo};
    use crate::domain::workflow::{WorkflowInstance, WorkflowStatus};
    use crate::impls::InMemoryEngine;
    use crate::typed::WorkflowData;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn step() -> StepInfo {
        StepInfo {
            id: 1,
            name: Some("Ship".into()),
        }
    }

    fn reconciler(engine: Arc<InMemoryEngine>) -> TerminationReconciler {
        TerminationReconciler::new(engine, Arc::new(PendingTerminations::new()), Duration::from_millis(10))
    }

    async fn started(engine: &InMemoryEngine) -> WorkflowId {
        engine.start_workflow("Order", 1, WorkflowData::Empty).await.unwrap()
    }

    #[tokio::test]
    async fn only_aborts_are_queued() {
        let engine = Arc::new(InMemoryEngine::new());
        let reconciler = reconciler(engine);
        let id = WorkflowId::new("wf");

        assert!(!reconciler.observe(&StepErrorEvent::new(id.clone(), step(), StepError::failure("retry me"))));
        assert!(reconciler.pending().is_empty());

        assert!(reconciler.observe(&StepErrorEvent::new(id.clone(), step(), StepError::abort("stop"))));
        assert!(!reconciler.observe(&StepErrorEvent::new(id.clone(), step(), StepError::abort("again"))));
        assert_eq!(reconciler.pending().snapshot(), vec![id]);
    }

    #[tokio::test]
    async fn refused_and_failed_terminations_are_retried() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = started(&engine).await;
        let reconciler = reconciler(engine.clone());
        reconciler.pending().insert(id.clone());
        engine.refuse_next_terminations(1);
        engine.fail_next_terminations(1);

        assert_eq!(reconciler.sweep().await, 0);
        assert!(reconciler.pending().contains(&id));
        assert_eq!(reconciler.sweep().await, 0);
        assert!(reconciler.pending().contains(&id));
        assert_eq!(reconciler.sweep().await, 1);

        assert!(reconciler.pending().is_empty());
        assert_eq!(engine.termination_attempts(), 3);
        let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Terminated);
    }

    /// Panics on the first termination, succeeds afterwards.
    struct Flaky {
        calls: AtomicU32,
        inner: InMemoryEngine,
    }

    #[async_trait]
    impl WorkflowEngine for Flaky {
        async fn start_workflow(&self, d: &str, v: u32, data: WorkflowData) -> Result<WorkflowId, EngineError> {
            self.inner.start_workflow(d, v, data).await
        }
        async fn terminate_workflow(&self, _id: &WorkflowId) -> Result<bool, EngineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("engine bug");
            }
            Ok(true)
        }
        async fn get_workflow_instance(&self, id: &WorkflowId) -> Result<Option<WorkflowInstance>, EngineError> {
            self.inner.get_workflow_instance(id).await
        }
        async fn create_new_workflow(&self, instance: WorkflowInstance) -> Result<WorkflowId, EngineError> {
            self.inner.create_new_workflow(instance).await
        }
        fn step_errors(&self) -> broadcast::Receiver<StepErrorEvent> {
            self.inner.step_errors()
        }
    }

    #[tokio::test]
    async fn engine_panic_keeps_the_id_pending() {
        let engine = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            inner: InMemoryEngine::new(),
        });
        let reconciler =
            TerminationReconciler::new(engine, Arc::new(PendingTerminations::new()), Duration::from_millis(10));
        let id = WorkflowId::new("wf");
        reconciler.pending().insert(id.clone());

        assert_eq!(reconciler.sweep().await, 0);
        assert!(reconciler.pending().contains(&id));
        assert_eq!(reconciler.sweep().await, 1);
        assert!(reconciler.pending().is_empty());
    }

    #[tokio::test]
    async fn run_keeps_retrying_an_engine_that_always_refuses() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = started(&engine).await;
        engine.refuse_next_terminations(u32::MAX);
        let reconciler = Arc::new(reconciler(engine.clone()));
        let cancel = CancellationToken::new();

        let errors = engine.step_errors();
        let task = {
            let reconciler = Arc::clone(&reconciler);
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.run_with(errors, cancel).await })
        };

        engine.raise_step_error(&id, step(), StepError::abort("operator stop"));
        for _ in 0..200 {
            if engine.termination_attempts() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        assert!(task.await.is_ok());
        assert!(engine.termination_attempts() >= 3);
        assert!(reconciler.pending().contains(&id));
        let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
        assert!(!instance.status.is_terminal());
    }

    #[tokio::test]
    async fn run_terminates_aborted_workflows_and_unsubscribes_on_cancel() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = started(&engine).await;
        let reconciler = Arc::new(reconciler(engine.clone()));
        let cancel = CancellationToken::new();

        let errors = engine.step_errors();
        let task = {
            let reconciler = Arc::clone(&reconciler);
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.run_with(errors, cancel).await })
        };

        engine.raise_step_error(&id, step(), StepError::abort("customer cancelled"));
        for _ in 0..200 {
            let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
            if instance.status == WorkflowStatus::Terminated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Terminated);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(engine.step_error_subscribers(), 0);
    }
}

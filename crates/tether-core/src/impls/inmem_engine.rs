//! InMemoryEngine - テスト・デモ用のワークフローエンジン
//!
//! 本物のエンジンの代わりに、インスタンスの保管・ライフサイクルフックの呼び出し・
//! ステップエラーの配信だけを行う。ステップの中身は実行しない。
//!
//! # 学習ポイント
//! - broadcast channel によるイベント配信（購読者ごとに Receiver）
//! - AtomicU32 で「あと n 回失敗する」を表現する
//! - フック呼び出し中はロックを握らない（スナップショットを clone して渡す）

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::domain::errors::EngineError;
use crate::domain::events::{StepError, StepErrorEvent, StepInfo};
use crate::domain::ids::WorkflowId;
use crate::domain::workflow::{ExecutionPointer, PointerStatus, WorkflowInstance, WorkflowStatus};
use crate::ports::{LifecycleHooks, WorkflowEngine};
use crate::typed::WorkflowData;

const EVENT_CAPACITY: usize = 256;

/// Step 0 of every workflow; it assigns the reference.
pub const INIT_STEP: &str = "Init";

pub struct InMemoryEngine {
    instances: Mutex<HashMap<WorkflowId, WorkflowInstance>>,
    hooks: RwLock<Option<Arc<dyn LifecycleHooks>>>,
    step_errors: broadcast::Sender<StepErrorEvent>,
    refused_terminations: AtomicU32,
    failed_terminations: AtomicU32,
    termination_attempts: AtomicU32,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        let (step_errors, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            instances: Mutex::new(HashMap::new()),
            hooks: RwLock::new(None),
            step_errors,
            refused_terminations: AtomicU32::new(0),
            failed_terminations: AtomicU32::new(0),
            termination_attempts: AtomicU32::new(0),
        }
    }

    pub fn set_hooks(&self, hooks: Arc<dyn LifecycleHooks>) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn LifecycleHooks>> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<WorkflowId, WorkflowInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, id: &WorkflowId) -> Option<WorkflowInstance> {
        self.instances().get(id).cloned()
    }

    /// Apply `f` to a stored instance and return the updated snapshot.
    fn update<F>(&self, id: &WorkflowId, f: F) -> Option<WorkflowInstance>
    where
        F: FnOnce(&mut WorkflowInstance),
    {
        let mut instances = self.instances();
        let instance = instances.get_mut(id)?;
        f(instance);
        Some(instance.clone())
    }

    /// Run one step through the before/after hooks.
    pub async fn run_step(&self, id: &WorkflowId, name: &str) -> Result<(), EngineError> {
        let step_id = self
            .snapshot(id)
            .map(|i| i.execution_pointers.len() as i32)
            .ok_or_else(|| EngineError::Unavailable(format!("unknown workflow {id}")))?;
        let step = StepInfo {
            id: step_id,
            name: Some(name.to_string()),
        };
        let pointer_id = format!("{id}-{step_id}");

        let before = self.update(id, |instance| {
            instance.execution_pointers.push(ExecutionPointer {
                id: pointer_id.clone(),
                step_id,
                step_name: Some(name.to_string()),
                active: true,
                status: PointerStatus::Running,
                start_time: Some(Utc::now()),
                end_time: None,
                retry_count: 0,
            });
        });
        if let (Some(hooks), Some(instance)) = (self.hooks(), before.as_ref()) {
            hooks.before_step(instance, &step).await;
        }

        let after = self.update(id, |instance| {
            if name == INIT_STEP {
                instance.ensure_reference();
            }
            if let Some(pointer) = instance.execution_pointers.iter_mut().find(|p| p.id == pointer_id) {
                pointer.active = false;
                pointer.status = PointerStatus::Complete;
                pointer.end_time = Some(Utc::now());
            }
        });
        if let (Some(hooks), Some(instance)) = (self.hooks(), after.as_ref()) {
            hooks.after_step(instance, &step).await;
        }
        Ok(())
    }

    /// Move an instance to `status` and run the post-workflow hook.
    pub async fn finish(&self, id: &WorkflowId, status: WorkflowStatus) -> Result<(), EngineError> {
        let instance = self
            .update(id, |instance| instance.transition(status))
            .ok_or_else(|| EngineError::Unavailable(format!("unknown workflow {id}")))?;
        if let Some(hooks) = self.hooks() {
            hooks.post_workflow(&instance).await;
        }
        Ok(())
    }

    /// Publish a step error to every `step_errors()` subscriber.
    pub fn raise_step_error(&self, id: &WorkflowId, step: StepInfo, error: StepError) {
        // no subscriber is not an error for the engine
        let _ = self
            .step_errors
            .send(StepErrorEvent::new(id.clone(), step, error));
    }

    /// The next `n` terminations answer `Ok(false)`.
    pub fn refuse_next_terminations(&self, n: u32) {
        self.refused_terminations.store(n, Ordering::SeqCst);
    }

    /// The next `n` terminations answer `Err(EngineError::Unavailable)`.
    pub fn fail_next_terminations(&self, n: u32) {
        self.failed_terminations.store(n, Ordering::SeqCst);
    }

    pub fn termination_attempts(&self) -> u32 {
        self.termination_attempts.load(Ordering::SeqCst)
    }

    pub fn step_error_subscribers(&self) -> usize {
        self.step_errors.receiver_count()
    }

    pub fn instance_count(&self) -> usize {
        self.instances().len()
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement `counter` if positive; true when it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl WorkflowEngine for InMemoryEngine {
    async fn start_workflow(
        &self,
        definition_id: &str,
        version: u32,
        data: WorkflowData,
    ) -> Result<WorkflowId, EngineError> {
        let id = WorkflowId::generate();
        let instance = WorkflowInstance::new(id.clone(), definition_id, version, data);
        self.instances().insert(id.clone(), instance.clone());

        if let Some(hooks) = self.hooks() {
            hooks.pre_workflow(&instance).await;
        }
        self.run_step(&id, INIT_STEP).await?;
        Ok(id)
    }

    async fn terminate_workflow(&self, id: &WorkflowId) -> Result<bool, EngineError> {
        self.termination_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failed_terminations) {
            return Err(EngineError::Unavailable("step still running".to_string()));
        }
        if take_one(&self.refused_terminations) {
            return Ok(false);
        }

        let terminated = self.update(id, |instance| {
            if !instance.status.is_terminal() {
                instance.transition(WorkflowStatus::Terminated);
            }
        });
        match terminated {
            Some(instance) => {
                if let Some(hooks) = self.hooks() {
                    hooks.post_workflow(&instance).await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_workflow_instance(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.snapshot(id))
    }

    async fn create_new_workflow(&self, instance: WorkflowInstance) -> Result<WorkflowId, EngineError> {
        let mut instances = self.instances();
        if instances.contains_key(&instance.id) {
            return Err(EngineError::AlreadyExists(instance.id.to_string()));
        }
        let id = instance.id.clone();
        instances.insert(id.clone(), instance);
        Ok(id)
    }

    fn step_errors(&self) -> broadcast::Receiver<StepErrorEvent> {
        self.step_errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LifecycleHooks for Trace {
        async fn pre_workflow(&self, instance: &WorkflowInstance) {
            self.calls.lock().unwrap().push(format!("pre:{}", instance.is_initialized()));
        }
        async fn post_workflow(&self, instance: &WorkflowInstance) {
            self.calls.lock().unwrap().push(format!("post:{}", instance.status));
        }
        async fn before_step(&self, _instance: &WorkflowInstance, step: &StepInfo) {
            self.calls.lock().unwrap().push(format!("before:{}", step.id));
        }
        async fn after_step(&self, instance: &WorkflowInstance, step: &StepInfo) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("after:{}:{}", step.id, instance.is_initialized()));
        }
    }

    #[tokio::test]
    async fn start_runs_init_and_assigns_reference() {
        let engine = InMemoryEngine::new();
        let trace = Arc::new(Trace::default());
        engine.set_hooks(trace.clone());

        let id = engine.start_workflow("Simple", 1, WorkflowData::Empty).await.unwrap();
        engine.finish(&id, WorkflowStatus::Complete).await.unwrap();

        let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
        assert!(instance.is_initialized());
        assert_eq!(
            *trace.calls.lock().unwrap(),
            vec!["pre:false", "before:0", "after:0:true", "post:Complete"]
        );
    }

    #[tokio::test]
    async fn scripted_termination_failures_run_out() {
        let engine = InMemoryEngine::new();
        let id = engine.start_workflow("Simple", 1, WorkflowData::Empty).await.unwrap();
        engine.fail_next_terminations(1);
        engine.refuse_next_terminations(1);

        assert!(engine.terminate_workflow(&id).await.is_err());
        assert!(!engine.terminate_workflow(&id).await.unwrap());
        assert!(engine.terminate_workflow(&id).await.unwrap());

        let instance = engine.get_workflow_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Terminated);
        assert_eq!(engine.termination_attempts(), 3);
    }

    #[tokio::test]
    async fn create_new_workflow_rejects_known_ids() {
        let engine = InMemoryEngine::new();
        let instance = WorkflowInstance::new(WorkflowId::new("ext-1"), "Simple", 1, WorkflowData::Empty);

        engine.create_new_workflow(instance.clone()).await.unwrap();
        let again = engine.create_new_workflow(instance).await;

        assert_eq!(again, Err(EngineError::AlreadyExists("ext-1".into())));
        assert_eq!(engine.instance_count(), 1);
    }

    #[tokio::test]
    async fn step_errors_reach_subscribers() {
        let engine = InMemoryEngine::new();
        let mut rx = engine.step_errors();
        let id = WorkflowId::new("wf-1");

        engine.raise_step_error(&id, StepInfo { id: 1, name: None }, StepError::abort("stop"));

        let event = rx.recv().await.unwrap();
        assert!(event.is_abort());
        assert_eq!(event.workflow_id, id);
    }
}

//! ReplicationHooks - エンジンのライフサイクルフックを複製につなぐ
//!
//! フックはエンジンの進行を止めない。複製に失敗してもログに残すだけで、
//! エラーはエンジンへ返さない。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::domain::events::StepInfo;
use crate::domain::workflow::WorkflowInstance;
use crate::ports::{InstancePersistence, LifecycleHooks};

pub struct ReplicationHooks {
    persistence: Arc<dyn InstancePersistence>,
}

impl ReplicationHooks {
    pub fn new(persistence: Arc<dyn InstancePersistence>) -> Self {
        Self { persistence }
    }

    async fn persist(&self, hook: &'static str, instance: &WorkflowInstance) {
        if let Err(e) = self.persistence.persist(instance).await {
            warn!(
                hook,
                workflow = %instance.id,
                status = %instance.status,
                error = %e,
                kind = ?e.kind(),
                "failed to replicate workflow state"
            );
        }
    }
}

#[async_trait]
impl LifecycleHooks for ReplicationHooks {
    async fn pre_workflow(&self, instance: &WorkflowInstance) {
        self.persist("pre_workflow", instance).await;
    }

    async fn post_workflow(&self, instance: &WorkflowInstance) {
        self.persist("post_workflow", instance).await;
    }

    async fn before_step(&self, instance: &WorkflowInstance, _step: &StepInfo) {
        self.persist("before_step", instance).await;
    }

    async fn after_step(&self, instance: &WorkflowInstance, _step: &StepInfo) {
        self.persist("after_step", instance).await;
    }
}

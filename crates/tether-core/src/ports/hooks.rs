//! LifecycleHooks port - エンジンから呼ばれるライフサイクルフック
//!
//! フックは読むだけで、エンジンの進行を止めたり変えたりしない。
//! そのため戻り値はなく、失敗は実装側でログに残す。

use async_trait::async_trait;

use crate::domain::events::StepInfo;
use crate::domain::workflow::WorkflowInstance;

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn pre_workflow(&self, instance: &WorkflowInstance);

    async fn post_workflow(&self, instance: &WorkflowInstance);

    async fn before_step(&self, instance: &WorkflowInstance, step: &StepInfo);

    async fn after_step(&self, instance: &WorkflowInstance, step: &StepInfo);
}

//! WorkflowEngine port - 外部のワークフロー実行エンジン
//!
//! ステップのスケジューリングや永続化はエンジンの仕事。
//! ここでは呼び出す操作と、購読するエラーイベントだけを定義する。

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::errors::EngineError;
use crate::domain::events::StepErrorEvent;
use crate::domain::ids::WorkflowId;
use crate::domain::workflow::WorkflowInstance;
use crate::typed::WorkflowData;

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn start_workflow(
        &self,
        definition_id: &str,
        version: u32,
        data: WorkflowData,
    ) -> Result<WorkflowId, EngineError>;

    /// `Ok(false)` means the engine refused for now (e.g. a step is still running).
    async fn terminate_workflow(&self, id: &WorkflowId) -> Result<bool, EngineError>;

    async fn get_workflow_instance(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, EngineError>;

    /// Adopt an instance that was created elsewhere.
    async fn create_new_workflow(&self, instance: WorkflowInstance) -> Result<WorkflowId, EngineError>;

    /// Subscribe to step errors. Dropping the receiver unsubscribes.
    fn step_errors(&self) -> broadcast::Receiver<StepErrorEvent>;
}

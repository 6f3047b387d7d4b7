//! Publisher / InstancePersistence ports

use async_trait::async_trait;

use crate::domain::errors::MirrorError;
use crate::domain::message::PublishIntent;
use crate::domain::workflow::WorkflowInstance;

/// Publisher はブローカーへの送信口
///
/// 複数のコンポーネントから同時に呼ばれてよい。
/// ブローカーが成功を返さなければ `MirrorError::Communication`。
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, intent: PublishIntent) -> Result<(), MirrorError>;
}

/// InstancePersistence はインスタンスの状態を外部へ書き出す
#[async_trait]
pub trait InstancePersistence: Send + Sync {
    async fn persist(&self, instance: &WorkflowInstance) -> Result<(), MirrorError>;
}

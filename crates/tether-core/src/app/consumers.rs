//! WorkflowInstanceConsumer - 他プロセスが公開したインスタンスを取り込む
//!
//! # 学習ポイント
//! - JsonHandler<WorkflowInstance> として書き、デコードは Json アダプタに任せる
//! - 既知のインスタンスは無視するので、同じメッセージが何度届いても安全

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::errors::{EngineError, HandlerError};
use crate::domain::workflow::WorkflowInstance;
use crate::ports::WorkflowEngine;
use crate::typed::{HandlerFactory, Json, JsonHandler};

pub struct WorkflowInstanceConsumer {
    engine: Arc<dyn WorkflowEngine>,
}

impl WorkflowInstanceConsumer {
    pub fn new(engine: Arc<dyn WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Factory building one consumer per received message.
    pub fn factory(engine: Arc<dyn WorkflowEngine>) -> impl HandlerFactory + 'static {
        move || Json::<WorkflowInstance, _>::new(WorkflowInstanceConsumer::new(Arc::clone(&engine)))
    }
}

#[async_trait]
impl JsonHandler<WorkflowInstance> for WorkflowInstanceConsumer {
    async fn handle(&self, topic: &str, instance: WorkflowInstance) -> Result<(), HandlerError> {
        let known = match self.engine.get_workflow_instance(&instance.id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(workflow = %instance.id, error = %e, "existence check failed, treating as unknown");
                false
            }
        };
        if known {
            debug!(workflow = %instance.id, topic, "instance already known");
            return Ok(());
        }

        let id = instance.id.clone();
        match self.engine.create_new_workflow(instance).await {
            Ok(_) => {
                info!(workflow = %id, topic, "adopted published workflow instance");
                Ok(())
            }
            Err(EngineError::AlreadyExists(_)) => {
                debug!(workflow = %id, "instance appeared concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{Reference, WorkflowId};
    use crate::domain::message::{InboundMessage, QoS};
    use crate::domain::workflow::WorkflowStatus;
    use crate::impls::InMemoryEngine;
    use crate::typed::{PayloadCodec, WorkflowData};

    fn published(id: &str) -> Arc<InboundMessage> {
        let mut instance = WorkflowInstance::new(WorkflowId::new(id), "Order", 1, WorkflowData::Empty);
        instance.reference = Reference::new("abcdef0123");
        let payload = PayloadCodec.encode_instance(&instance).unwrap();
        Arc::new(InboundMessage::new(
            "workflows-core/Order:v1/active/abcdef01/instance",
            payload,
            true,
            QoS::AtLeastOnce,
        ))
    }

    #[tokio::test]
    async fn unknown_instances_are_adopted_once() {
        let engine = Arc::new(InMemoryEngine::new());
        let factory = WorkflowInstanceConsumer::factory(engine.clone());

        factory.create().handle(published("wf-remote")).await.unwrap();
        factory.create().handle(published("wf-remote")).await.unwrap();

        assert_eq!(engine.instance_count(), 1);
        let adopted = engine
            .get_workflow_instance(&WorkflowId::new("wf-remote"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(adopted.status, WorkflowStatus::Running);
        assert_eq!(adopted.reference.as_str(), "abcdef0123");
    }

    #[tokio::test]
    async fn tombstones_are_ignored() {
        let engine = Arc::new(InMemoryEngine::new());
        let factory = WorkflowInstanceConsumer::factory(engine.clone());
        let tombstone = Arc::new(InboundMessage::new("a/b", Vec::new(), true, QoS::AtLeastOnce));

        factory.create().handle(tombstone).await.unwrap();

        assert_eq!(engine.instance_count(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_error() {
        let engine = Arc::new(InMemoryEngine::new());
        let factory = WorkflowInstanceConsumer::factory(engine);
        let garbage = Arc::new(InboundMessage::new("a/b", b"{\"id\":".to_vec(), false, QoS::AtLeastOnce));

        let err = factory.create().handle(garbage).await.unwrap_err();

        assert!(matches!(err, HandlerError::Payload(_)));
    }
}

//! StateReplicator - インスタンスの状態を retained メッセージとして複製する
//!
//! # 学習ポイント
//! - 何を送るか（plan）と実際に送る処理（replicate）を分け、plan は純粋関数にする
//! - 終了したインスタンスは active を tombstone で消してから final に書く
//! - TTL で、クラッシュしたプロセスの古い active 状態もいずれ消える

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::ReplicationSettings;
use crate::domain::errors::MirrorError;
use crate::domain::message::PublishIntent;
use crate::domain::topic::{StatusSegment, TopicScheme};
use crate::domain::workflow::WorkflowInstance;
use crate::ports::{InstancePersistence, Publisher};
use crate::typed::PayloadCodec;

/// How long the broker keeps replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub active_ttl: Duration,
    pub final_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            active_ttl: Duration::from_secs(4 * 60 * 60),
            final_ttl: Duration::from_secs(4 * 24 * 60 * 60),
        }
    }
}

pub struct StateReplicator {
    publisher: Arc<dyn Publisher>,
    scheme: TopicScheme,
    retention: RetentionPolicy,
    codec: PayloadCodec,
}

impl StateReplicator {
    pub fn new(publisher: Arc<dyn Publisher>, scheme: TopicScheme, retention: RetentionPolicy) -> Self {
        Self {
            publisher,
            scheme,
            retention,
            codec: PayloadCodec,
        }
    }

    pub fn from_settings(publisher: Arc<dyn Publisher>, settings: &ReplicationSettings) -> Self {
        Self::new(
            publisher,
            settings.scheme(),
            RetentionPolicy {
                active_ttl: settings.active_ttl(),
                final_ttl: settings.final_ttl(),
            },
        )
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// The publishes that mirror `instance`, in the order they must be sent.
    ///
    /// An instance without a reference has no topic yet and yields nothing.
    pub fn plan(&self, instance: &WorkflowInstance) -> Result<Vec<PublishIntent>, MirrorError> {
        if !instance.is_initialized() {
            return Ok(Vec::new());
        }
        let payload = self.codec.encode_instance(instance)?;
        let active = self.scheme.instance_topic(instance, StatusSegment::Active)?;

        if !instance.status.is_terminal() {
            return Ok(vec![
                PublishIntent::json(active, payload)
                    .retained()
                    .expires_after(self.retention.active_ttl),
            ]);
        }

        let finished = self.scheme.instance_topic(instance, StatusSegment::Final)?;
        Ok(vec![
            PublishIntent::tombstone(active),
            PublishIntent::json(finished, payload)
                .retained()
                .expires_after(self.retention.final_ttl),
        ])
    }

    /// Publish the current state of `instance`; returns how many publishes were sent.
    ///
    /// Publishes go out one at a time. If the tombstone fails the final
    /// record is not written.
    #[instrument(skip_all, fields(workflow = %instance.id, status = %instance.status))]
    pub async fn replicate(&self, instance: &WorkflowInstance) -> Result<usize, MirrorError> {
        let intents = self.plan(instance)?;
        if intents.is_empty() {
            debug!("no reference yet, nothing to replicate");
            return Ok(0);
        }

        let count = intents.len();
        for intent in intents {
            self.publisher.publish(intent).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl InstancePersistence for StateReplicator {
    async fn persist(&self, instance: &WorkflowInstance) -> Result<(), MirrorError> {
        self.replicate(instance).await.map(|_| ())
    }
}

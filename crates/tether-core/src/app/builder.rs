//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定・依存の欠落・購読の重複は build() で止める
//! - 依存は trait object（Arc<dyn Transport> など）で受け取り、テストでは InMemory を差す

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection::{ConnectionManager, ConnectionOptions};
use super::consumers::WorkflowInstanceConsumer;
use super::dispatcher::Dispatcher;
use super::hooks::ReplicationHooks;
use super::reconciler::{PendingTerminations, TerminationReconciler};
use super::replicator::StateReplicator;
use super::status::MirrorStatus;
use crate::config::{ConfigError, MirrorConfig};
use crate::domain::errors::MirrorError;
use crate::ports::{LifecycleHooks, Transport, TransportEvents, WorkflowEngine};
use crate::typed::{ConsumerRegistry, HandlerFactory, RegistryError};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let (transport, events) = RumqttTransport::new(&config.mqtt);
/// let app = AppBuilder::new(config)
///     .transport(Arc::new(transport), events)
///     .engine(engine.clone())
///     .consume("plant/+/temp", || Json::new(TemperatureHandler))?
///     .build()?;
/// engine.set_hooks(app.hooks());
/// app.run(cancel).await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_consumers() で期待されるフィルタを登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    config: MirrorConfig,
    transport: Option<(Arc<dyn Transport>, TransportEvents)>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    registry: Arc<ConsumerRegistry>,
    expected_consumers: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no transport configured")]
    MissingTransport,

    #[error("no workflow engine configured")]
    MissingEngine,

    #[error("Missing consumers: {0:?}. These filters were expected but not registered.")]
    MissingConsumers(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registration(#[from] RegistryError),
}

impl AppBuilder {
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            config,
            transport: None,
            engine: None,
            registry: Arc::new(ConsumerRegistry::new()),
            expected_consumers: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>, events: TransportEvents) -> Self {
        self.transport = Some((transport, events));
        self
    }

    pub fn engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Consumer を登録
    ///
    /// 同じフィルタの二重登録はここでエラーになる。
    pub fn consume<F>(self, filter: &str, factory: F) -> Result<Self, RegistryError>
    where
        F: HandlerFactory + 'static,
    {
        self.registry.register(filter, factory)?;
        Ok(self)
    }

    /// 期待されるフィルタのリストを設定
    pub fn expect_consumers(mut self, filters: &[&str]) -> Self {
        self.expected_consumers = Some(filters.iter().map(|f| f.to_string()).collect());
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - 設定の検証
    /// - Transport と Engine が設定されているか
    /// - 取り込み用 consumer が既存の登録と衝突しないか
    /// - expect_consumers() のフィルタが全て登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let (transport, events) = self.transport.ok_or(BuildError::MissingTransport)?;
        let engine = self.engine.ok_or(BuildError::MissingEngine)?;

        if self.config.consumers.adopt_published_instances {
            self.registry.register(
                &self.config.adoption_filter(),
                WorkflowInstanceConsumer::factory(Arc::clone(&engine)),
            )?;
        }

        if let Some(expected) = &self.expected_consumers {
            let registered: Vec<String> = self.registry.filters().iter().map(|f| f.to_string()).collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|f| !registered.contains(f))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingConsumers(missing));
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.registry)));
        let connection = Arc::new(ConnectionManager::new(
            transport,
            events,
            dispatcher,
            ConnectionOptions::from_config(&self.config),
        ));
        let replicator = Arc::new(StateReplicator::from_settings(
            connection.clone(),
            &self.config.replication,
        ));
        let hooks = Arc::new(ReplicationHooks::new(replicator.clone()));
        let reconciler = Arc::new(TerminationReconciler::new(
            Arc::clone(&engine),
            Arc::new(PendingTerminations::new()),
            self.config.reconciler.interval(),
        ));

        Ok(App {
            registry: self.registry,
            connection,
            replicator,
            hooks,
            reconciler,
            engine,
        })
    }
}

/// App はアプリケーションのランタイム
///
/// 接続・複製・終了調停をまとめて持ち、`run()` でキャンセルまで動かす。
pub struct App {
    registry: Arc<ConsumerRegistry>,
    connection: Arc<ConnectionManager>,
    replicator: Arc<StateReplicator>,
    hooks: Arc<ReplicationHooks>,
    reconciler: Arc<TerminationReconciler>,
    engine: Arc<dyn WorkflowEngine>,
}

impl App {
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn replicator(&self) -> &Arc<StateReplicator> {
        &self.replicator
    }

    /// Hooks to install on the engine so lifecycle events are replicated.
    pub fn hooks(&self) -> Arc<dyn LifecycleHooks> {
        self.hooks.clone()
    }

    pub fn reconciler(&self) -> &Arc<TerminationReconciler> {
        &self.reconciler
    }

    pub async fn status(&self) -> MirrorStatus {
        MirrorStatus {
            connected: self.connection.is_ready(),
            subscriptions: self
                .connection
                .subscriptions()
                .await
                .iter()
                .map(|f| f.to_string())
                .collect(),
            consumers: self.registry.filters().iter().map(|f| f.to_string()).collect(),
            in_flight_handlers: self.connection.dispatcher().in_flight(),
            pending_terminations: self.reconciler.pending().snapshot(),
        }
    }

    /// Connect, reconcile terminations and serve consumers until `cancel`.
    ///
    /// An unreachable broker is not an error: the transport keeps
    /// reconnecting in the background. Only fatal errors end `run` early.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MirrorError> {
        // subscribe before connecting so no abort raised meanwhile is missed
        let errors = self.engine.step_errors();
        let reconciling = cancel.child_token();
        let reconciler = Arc::clone(&self.reconciler);
        let reconcile = {
            let token = reconciling.clone();
            tokio::spawn(async move { reconciler.run_with(errors, token).await })
        };

        let started = self.connection.start(&cancel).await;
        match started {
            Ok(()) => info!("mirror running"),
            Err(e) if e.is_fatal() => {
                reconciling.cancel();
                let _ = reconcile.await;
                return Err(e);
            }
            Err(e) if cancel.is_cancelled() => info!(error = %e, "cancelled during startup"),
            Err(e) => warn!(error = %e, "broker not reachable yet, reconnecting in background"),
        }

        cancel.cancelled().await;
        reconciling.cancel();
        if let Err(e) = reconcile.await {
            warn!(error = %e, "termination reconciler ended abnormally");
        }
        // `cancel` already fired; the shutdown grace still applies
        self.connection.stop(&CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{StepError, StepInfo};
    use crate::domain::ids::WorkflowId;
    use crate::domain::message::{InboundMessage, QoS};
    use crate::domain::topic::StatusSegment;
    use crate::domain::workflow::{WorkflowInstance, WorkflowStatus};
    use crate::impls::{InMemoryEngine, InMemoryTransport};
    use crate::typed::{PayloadCodec, WorkflowData};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        app: Arc<App>,
        transport: Arc<InMemoryTransport>,
        engine: Arc<InMemoryEngine>,
        cancel: CancellationToken,
        running: JoinHandle<Result<(), MirrorError>>,
    }

    fn config() -> MirrorConfig {
        MirrorConfig::from_yaml("reconciler:\n  interval_ms: 10\ndispatch:\n  shutdown_grace_ms: 500").unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn running() -> Harness {
        let (transport, events) = InMemoryTransport::new();
        let transport = Arc::new(transport);
        let engine = Arc::new(InMemoryEngine::new());
        let app = Arc::new(
            AppBuilder::new(config())
                .transport(transport.clone(), events)
                .engine(engine.clone())
                .build()
                .unwrap(),
        );
        engine.set_hooks(app.hooks());

        let cancel = CancellationToken::new();
        let running = {
            let app = Arc::clone(&app);
            let cancel = cancel.clone();
            tokio::spawn(async move { app.run(cancel).await })
        };
        let connection = Arc::clone(app.connection());
        eventually(|| connection.is_ready()).await;

        Harness {
            app,
            transport,
            engine,
            cancel,
            running,
        }
    }

    impl Harness {
        async fn instance(&self, id: &WorkflowId) -> WorkflowInstance {
            self.engine.get_workflow_instance(id).await.unwrap().unwrap()
        }

        fn topic(&self, instance: &WorkflowInstance, segment: StatusSegment) -> String {
            self.app.replicator().scheme().instance_topic(instance, segment).unwrap()
        }

        async fn shutdown(self) -> Arc<InMemoryEngine> {
            self.cancel.cancel();
            self.running.await.unwrap().unwrap();
            self.engine
        }
    }

    #[tokio::test]
    async fn completed_workflow_moves_from_active_to_final() {
        let h = running().await;

        let id = h.engine.start_workflow("Order", 3, WorkflowData::Empty).await.unwrap();
        let started = h.instance(&id).await;
        let active = h.topic(&started, StatusSegment::Active);
        let finished = h.topic(&started, StatusSegment::Final);
        assert!(active.starts_with("workflows-core/Order:v3/active/"));
        assert!(h.transport.retained(&active).is_some());

        h.engine.finish(&id, WorkflowStatus::Complete).await.unwrap();

        assert_eq!(h.transport.retained(&active), None);
        let record = PayloadCodec.decode_instance(&h.transport.retained(&finished).unwrap()).unwrap();
        assert_eq!(record.status, WorkflowStatus::Complete);
        assert_eq!(record.reference, started.reference);

        let published = h.transport.published();
        let tombstone = published.iter().position(|p| p.topic == active && p.is_tombstone()).unwrap();
        let final_record = published.iter().position(|p| p.topic == finished).unwrap();
        assert!(tombstone < final_record);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn nothing_is_published_before_the_reference_exists() {
        let h = running().await;

        h.engine.start_workflow("Order", 1, WorkflowData::Empty).await.unwrap();

        // pre_workflow and before_step(Init) see no reference yet
        let published = h.transport.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].topic.contains("/active/"));

        h.shutdown().await;
    }

    #[tokio::test]
    async fn aborted_workflow_is_terminated_and_archived() {
        let h = running().await;
        let id = h.engine.start_workflow("Order", 1, WorkflowData::Empty).await.unwrap();
        h.engine.refuse_next_terminations(2);

        h.engine.raise_step_error(
            &id,
            StepInfo {
                id: 1,
                name: Some("Charge".into()),
            },
            StepError::abort("card declined"),
        );

        let reconciler = Arc::clone(h.app.reconciler());
        eventually(|| h.engine.termination_attempts() >= 3 && reconciler.pending().is_empty()).await;
        let terminated = h.instance(&id).await;
        assert_eq!(terminated.status, WorkflowStatus::Terminated);
        assert!(h.transport.retained(&h.topic(&terminated, StatusSegment::Final)).is_some());
        assert_eq!(h.transport.retained(&h.topic(&terminated, StatusSegment::Active)), None);

        let engine = h.shutdown().await;
        assert_eq!(engine.step_error_subscribers(), 0);
    }

    #[tokio::test]
    async fn instances_published_elsewhere_are_adopted() {
        let h = running().await;
        let mut remote = WorkflowInstance::new(WorkflowId::new("remote-1"), "Order", 1, WorkflowData::Empty);
        remote.ensure_reference();
        let topic = h.topic(&remote, StatusSegment::Active);

        h.transport.inject(InboundMessage::new(
            topic,
            PayloadCodec.encode_instance(&remote).unwrap(),
            true,
            QoS::AtLeastOnce,
        ));

        let engine = Arc::clone(&h.engine);
        eventually(|| engine.instance_count() == 1).await;
        assert_eq!(h.instance(&remote.id).await.reference, remote.reference);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_subscriptions_and_connectivity() {
        let h = running().await;

        let status = h.app.status().await;

        assert!(status.connected);
        assert_eq!(status.subscriptions, vec!["workflows-core/+/active/+/instance"]);
        assert_eq!(status.consumers, status.subscriptions);
        assert!(status.is_idle());

        let app = Arc::clone(&h.app);
        h.shutdown().await;
        assert!(!app.status().await.connected);
    }

    fn builder() -> AppBuilder {
        let (transport, events) = InMemoryTransport::new();
        AppBuilder::new(MirrorConfig::default())
            .transport(Arc::new(transport), events)
            .engine(Arc::new(InMemoryEngine::new()))
    }

    #[test]
    fn build_requires_transport_and_engine() {
        assert!(matches!(
            AppBuilder::new(MirrorConfig::default()).build(),
            Err(BuildError::MissingTransport)
        ));

        let (transport, events) = InMemoryTransport::new();
        let without_engine = AppBuilder::new(MirrorConfig::default())
            .transport(Arc::new(transport), events)
            .build();
        assert!(matches!(without_engine, Err(BuildError::MissingEngine)));
    }

    #[test]
    fn build_rejects_a_consumer_clashing_with_adoption() {
        let engine: Arc<dyn WorkflowEngine> = Arc::new(InMemoryEngine::new());
        let result = builder()
            .consume(
                "workflows-core/+/active/+/instance",
                WorkflowInstanceConsumer::factory(engine),
            )
            .unwrap()
            .build();

        assert!(matches!(result, Err(BuildError::Registration(RegistryError::AlreadyRegistered(_)))));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = MirrorConfig::default();
        config.reconciler.interval_ms = 0;
        let (transport, events) = InMemoryTransport::new();

        let result = AppBuilder::new(config)
            .transport(Arc::new(transport), events)
            .engine(Arc::new(InMemoryEngine::new()))
            .build();

        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[test]
    fn build_missing_consumers() {
        let result = builder()
            .expect_consumers(&["workflows-core/+/active/+/instance", "plant/#"])
            .build();

        assert!(matches!(
            result,
            Err(BuildError::MissingConsumers(missing)) if missing == vec!["plant/#".to_string()]
        ));
    }
}

//! ConnectionManager - 単一のブローカー接続と購読の管理
//!
//! # 学習ポイント
//! - 受信ループは専用タスク。Dispatcher へ渡したら次のイベントへ進む
//! - 覚えている購読は (再) 接続のたびに全部やり直してから ready にする
//! - 購読集合のロックを再購読中も握るので、途中で追加された購読が漏れない
//! - 失敗した購読は未確認として残し、受信ループが定期的にやり直す。全部通るまで ready にしない
//! - 準備完了は watch channel で知らせる

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::dispatcher::Dispatcher;
use crate::config::MirrorConfig;
use crate::domain::errors::{MirrorError, TransportError};
use crate::domain::message::{PublishIntent, QoS};
use crate::domain::topic::{TopicFilter, validate_topic_name};
use crate::ports::{Publisher, Transport, TransportEvent, TransportEvents};
use crate::typed::HandlerFactory;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// QoS requested for every subscription.
    pub subscribe_qos: QoS,
    /// How long `start()` waits for the first successful connect.
    pub connect_timeout: Duration,
    /// How long `stop()` waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// How often failed subscriptions are retried while connected.
    pub resubscribe_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            subscribe_qos: QoS::AtLeastOnce,
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            resubscribe_interval: Duration::from_secs(1),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            subscribe_qos: QoS::AtLeastOnce,
            connect_timeout: config.mqtt.connect_timeout(),
            shutdown_grace: config.dispatch.shutdown_grace(),
            resubscribe_interval: config.mqtt.reconnect_delay(),
        }
    }
}

#[derive(Debug, Default)]
struct SubscriptionSet {
    remembered: BTreeSet<TopicFilter>,
    /// Remembered but not acknowledged by the broker since the last connect.
    unconfirmed: BTreeSet<TopicFilter>,
}

impl SubscriptionSet {
    /// Subscribe every unconfirmed filter once; returns how many are still unconfirmed.
    async fn confirm(&mut self, transport: &dyn Transport, qos: QoS) -> usize {
        let attempts: Vec<TopicFilter> = self.unconfirmed.iter().cloned().collect();
        for filter in attempts {
            match transport.subscribe(&filter, qos).await {
                Ok(()) => {
                    self.unconfirmed.remove(&filter);
                    info!(%filter, "subscribed");
                }
                Err(e) => warn!(%filter, error = %e, "subscribe failed, will retry"),
            }
        }
        self.unconfirmed.len()
    }
}

type Subscriptions = Arc<tokio::sync::Mutex<SubscriptionSet>>;

struct ReceiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<TransportEvents>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    options: ConnectionOptions,
    subscriptions: Subscriptions,
    ready: Arc<watch::Sender<bool>>,
    /// Parked event stream while no receive loop runs.
    events: Mutex<Option<TransportEvents>>,
    receive: tokio::sync::Mutex<Option<ReceiveLoop>>,
}

impl ConnectionManager {
    /// Filters already in the dispatcher's registry are remembered right away.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        dispatcher: Arc<Dispatcher>,
        options: ConnectionOptions,
    ) -> Self {
        let remembered = SubscriptionSet {
            remembered: dispatcher.registry().filters().into_iter().collect(),
            unconfirmed: BTreeSet::new(),
        };
        let (ready, _) = watch::channel(false);
        Self {
            transport,
            dispatcher,
            options,
            subscriptions: Arc::new(tokio::sync::Mutex::new(remembered)),
            ready: Arc::new(ready),
            events: Mutex::new(Some(events)),
            receive: tokio::sync::Mutex::new(None),
        }
    }

    fn parked(&self) -> MutexGuard<'_, Option<TransportEvents>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Connected, and the broker acknowledged every remembered filter.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until [`Self::is_ready`] turns true.
    pub async fn wait_ready(&self) -> Result<(), TransportError> {
        let mut ready = self.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ConnectionLost)
    }

    pub async fn subscriptions(&self) -> Vec<TopicFilter> {
        self.subscriptions.lock().await.remembered.iter().cloned().collect()
    }

    /// Connect and wait until the remembered filters are subscribed.
    ///
    /// Returns immediately when already connected. On timeout or
    /// cancellation the transport keeps reconnecting in the background.
    #[instrument(skip_all)]
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), MirrorError> {
        self.ensure_receiving().await?;
        if self.is_ready() {
            return Ok(());
        }
        self.dispatcher.reopen();
        self.transport.connect().await?;

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            waited = tokio::time::timeout(self.options.connect_timeout, self.wait_ready()) => match waited {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(TransportError::Timeout(self.options.connect_timeout).into()),
            },
        }
    }

    /// Disconnect with a normal reason code and stop receiving.
    ///
    /// In-flight handlers get the shutdown grace period, then are abandoned.
    /// Cancelling `cancel` ends the wait early; the disconnect itself always
    /// runs to completion and is bounded by the transport's own timeout.
    #[instrument(skip_all)]
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), MirrorError> {
        let disconnected = self.transport.disconnect().await;

        if let Some(receive) = self.receive.lock().await.take() {
            receive.cancel.cancel();
            match receive.handle.await {
                Ok(events) => *self.parked() = Some(events),
                Err(e) => warn!(error = %e, "receive loop ended abnormally"),
            }
        }
        self.ready.send_replace(false);
        tokio::select! {
            biased;

            _ = self.dispatcher.shutdown(self.options.shutdown_grace) => {}
            _ = cancel.cancelled() => {
                warn!(in_flight = self.dispatcher.in_flight(), "stop cancelled, abandoning in-flight handlers");
            }
        }
        info!("connection stopped");

        disconnected.map_err(Into::into)
    }

    /// Remember `filter` and subscribe now if connected.
    ///
    /// While disconnected the filter is only remembered; the next connect
    /// subscribes it together with all the others.
    pub async fn subscribe(&self, filter: &str) -> Result<TopicFilter, MirrorError> {
        let filter = TopicFilter::new(filter)?;
        self.remember(filter.clone()).await;
        Ok(filter)
    }

    /// Register a consumer and subscribe its filter.
    ///
    /// Duplicate filters fail with a registration error.
    pub async fn add_consumer<F>(&self, filter: &str, factory: F) -> Result<TopicFilter, MirrorError>
    where
        F: HandlerFactory + 'static,
    {
        let filter = self.dispatcher.registry().register(filter, factory)?;
        self.remember(filter.clone()).await;
        Ok(filter)
    }

    async fn remember(&self, filter: TopicFilter) {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.remembered.insert(filter.clone()) {
            return;
        }
        if !self.is_ready() {
            debug!(%filter, "remembered, subscribing once connected");
            subscriptions.unconfirmed.insert(filter);
            return;
        }
        match self.transport.subscribe(&filter, self.options.subscribe_qos).await {
            Ok(()) => info!(%filter, "subscribed"),
            Err(e) => {
                warn!(%filter, error = %e, "subscribe failed, not ready until it is retried");
                subscriptions.unconfirmed.insert(filter);
                self.ready.send_replace(false);
            }
        }
    }

    async fn ensure_receiving(&self) -> Result<(), MirrorError> {
        let mut receive = self.receive.lock().await;
        if receive.is_some() {
            return Ok(());
        }
        let events = self
            .parked()
            .take()
            .ok_or_else(|| TransportError::Client("transport event stream is gone".to_string()))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receive_loop(
            events,
            Arc::clone(&self.transport),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.ready),
            self.options.clone(),
            cancel.clone(),
        ));
        *receive = Some(ReceiveLoop { cancel, handle });
        Ok(())
    }
}

async fn receive_loop(
    mut events: TransportEvents,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Subscriptions,
    ready: Arc<watch::Sender<bool>>,
    options: ConnectionOptions,
    cancel: CancellationToken,
) -> TransportEvents {
    let qos = options.subscribe_qos;
    let mut retry = tokio::time::interval(options.resubscribe_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut connected = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
            _ = retry.tick(), if connected => {
                let mut subscriptions = subscriptions.lock().await;
                if subscriptions.unconfirmed.is_empty() {
                    continue;
                }
                if subscriptions.confirm(transport.as_ref(), qos).await == 0 {
                    info!("remaining filters subscribed, ready");
                    ready.send_replace(true);
                }
                continue;
            }
        };

        match event {
            Some(TransportEvent::Connected { session_present }) => {
                connected = true;
                let mut subscriptions = subscriptions.lock().await;
                subscriptions.unconfirmed = subscriptions.remembered.clone();
                info!(session_present, filters = subscriptions.remembered.len(), "connected, resubscribing");
                let unconfirmed = subscriptions.confirm(transport.as_ref(), qos).await;
                if unconfirmed > 0 {
                    warn!(unconfirmed, "not ready until every filter is subscribed");
                }
                ready.send_replace(unconfirmed == 0);
                retry.reset();
            }
            Some(TransportEvent::Disconnected { reason }) => {
                connected = false;
                ready.send_replace(false);
                warn!(reason, "disconnected");
            }
            Some(TransportEvent::Message(message)) => {
                dispatcher.dispatch(message);
            }
            None => {
                warn!("transport event stream closed");
                break;
            }
        }
    }
    ready.send_replace(false);
    events
}

#[async_trait]
impl Publisher for ConnectionManager {
    async fn publish(&self, intent: PublishIntent) -> Result<(), MirrorError> {
        validate_topic_name(&intent.topic)?;
        let ack = self.transport.publish(&intent).await?;
        if !ack.is_success() {
            return Err(MirrorError::Communication {
                topic: intent.topic,
                reason: ack.to_string(),
            });
        }
        debug!(
            topic = %intent.topic,
            retained = intent.retained,
            tombstone = intent.is_tombstone(),
            "published"
        );
        Ok(())
    }
}

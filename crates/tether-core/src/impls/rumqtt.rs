//! RumqttTransport - MQTT v5 over `rumqttc`
//!
//! `rumqttc` の EventLoop をバックグラウンドタスクで回し続け、
//! 受信した Packet を [`TransportEvent`] に変換して流す。
//!
//! # 学習ポイント
//! - publish の完了は EventLoop 側で観測する（`Outgoing::Publish(pkid)` → `PubAck`）
//! - 要求順と送信順が一致するので、FIFO で待ち手と pkid を対応付けられる
//! - 切断時は未応答の publish を ConnectionLost で失敗させる（再送分は数えない）
//! - subscribe も SubAck まで待つ。rumqttc は拒否された SubAck を接続エラー
//!   （`StateError::SubFail`）として返すので、subscribe は 1 件ずつ送って拒否を対応付ける
//! - セッション有効期限は CONNECT の properties で渡す（0 だと切断でセッションが消える）

use async_trait::async_trait;
use rumqttc::Outgoing;
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::mqttbytes::v5::{
    ConnectProperties, Packet, PubAckReason, PubRecReason, PublishProperties, SubAck, SubscribeReasonCode,
};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, StateError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttSettings;
use crate::domain::errors::TransportError;
use crate::domain::message::{AckReason, InboundMessage, PublishIntent, QoS};
use crate::domain::topic::TopicFilter;
use crate::ports::{Transport, TransportEvent, TransportEvents};

const REQUEST_CAPACITY: usize = 64;

type AckResult = Result<AckReason, TransportError>;
type SubscribeResult = Result<(), TransportError>;

fn to_mqtt(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

fn from_mqtt(qos: MqttQoS) -> QoS {
    match qos {
        MqttQoS::AtMostOnce => QoS::AtMostOnce,
        MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn puback_reason(reason: PubAckReason) -> AckReason {
    match reason {
        PubAckReason::Success => AckReason::Success,
        PubAckReason::NoMatchingSubscribers => AckReason::NoMatchingSubscribers,
        other => AckReason::Rejected(format!("{other:?}")),
    }
}

fn pubrec_reason(reason: PubRecReason) -> AckReason {
    match reason {
        PubRecReason::Success => AckReason::Success,
        PubRecReason::NoMatchingSubscribers => AckReason::NoMatchingSubscribers,
        other => AckReason::Rejected(format!("{other:?}")),
    }
}

/// First refusal in a SubAck, if any.
fn suback_refusal(ack: &SubAck) -> Option<String> {
    ack.return_codes
        .iter()
        .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        .map(|code| format!("{code:?}"))
}

fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    let mut connect = ConnectProperties::new();
    connect.session_expiry_interval = Some(settings.session_expiry_secs);
    options
        .set_keep_alive(settings.keep_alive())
        .set_clean_start(settings.clean_start)
        .set_connect_properties(connect);
    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

fn properties(intent: &PublishIntent) -> PublishProperties {
    PublishProperties {
        message_expiry_interval: intent.expiry_secs(),
        content_type: intent.content_type.clone(),
        ..Default::default()
    }
}

/// AckBook は publish の待ち手と packet id を対応付ける
///
/// - `expect()`: publish 要求の直前に待ち手を積む（要求順）
/// - `sent()`: EventLoop が送信した順に取り出し、pkid に紐付ける
/// - `acked()`: ブローカー応答で待ち手を起こす
#[derive(Default)]
struct AckBook {
    queued: VecDeque<(QoS, oneshot::Sender<AckResult>)>,
    inflight: HashMap<u16, oneshot::Sender<AckResult>>,
    /// pkids whose waiter already failed; the client re-sends them after reconnect
    retransmit: HashSet<u16>,
}

impl AckBook {
    fn expect(&mut self, qos: QoS, waiter: oneshot::Sender<AckResult>) {
        self.queued.push_back((qos, waiter));
    }

    /// Undo the latest `expect()` when the request never reached the client.
    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if pkid != 0 && self.retransmit.remove(&pkid) {
            return;
        }
        let Some((qos, waiter)) = self.queued.pop_front() else {
            return;
        };
        if qos == QoS::AtMostOnce {
            let _ = waiter.send(Ok(AckReason::Success));
        } else {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16, reason: AckReason) {
        self.retransmit.remove(&pkid);
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(Ok(reason));
        }
    }

    fn connection_lost(&mut self) {
        for (pkid, waiter) in self.inflight.drain() {
            self.retransmit.insert(pkid);
            let _ = waiter.send(Err(TransportError::ConnectionLost));
        }
    }

    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

/// SubscribeBook は subscribe の待ち手を SubAck に対応付ける
///
/// Subscriptions go out one at a time, so at most one is in flight and a
/// refusal reported without a pkid still belongs to it.
#[derive(Default)]
struct SubscribeBook {
    queued: VecDeque<(String, oneshot::Sender<SubscribeResult>)>,
    inflight: HashMap<u16, (String, oneshot::Sender<SubscribeResult>)>,
}

impl SubscribeBook {
    fn expect(&mut self, filter: &TopicFilter, waiter: oneshot::Sender<SubscribeResult>) {
        self.queued.push_back((filter.as_str().to_string(), waiter));
    }

    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(entry) = self.queued.pop_front() {
            self.inflight.insert(pkid, entry);
        }
    }

    fn acked(&mut self, ack: &SubAck) {
        let Some((filter, waiter)) = self.inflight.remove(&ack.pkid) else {
            return;
        };
        let result = match suback_refusal(ack) {
            None => Ok(()),
            Some(reason) => {
                warn!(filter = %filter, reason = %reason, "broker refused subscription");
                Err(TransportError::SubscriptionRefused { filter, reason })
            }
        };
        let _ = waiter.send(result);
    }

    /// The broker refused what is in flight; rumqttc drops the connection next.
    fn refused(&mut self, reason: String) {
        for (_, (filter, waiter)) in self.inflight.drain() {
            warn!(filter = %filter, reason = %reason, "broker refused subscription");
            let _ = waiter.send(Err(TransportError::SubscriptionRefused {
                filter,
                reason: reason.clone(),
            }));
        }
    }

    /// Sent subscriptions are not re-sent after reconnect; queued ones still go out.
    fn connection_lost(&mut self) {
        for (_, (_, waiter)) in self.inflight.drain() {
            let _ = waiter.send(Err(TransportError::ConnectionLost));
        }
    }

    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

struct Shared {
    connected: AtomicBool,
    book: Mutex<AckBook>,
    subscriptions: Mutex<SubscribeBook>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, AckBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscribeBook> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn lost(&self, reason: String) {
        self.book().connection_lost();
        self.subscriptions().connection_lost();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected { reason });
        }
    }
}

/// The event loop while it is parked or being driven.
#[derive(Default)]
struct Driver {
    idle: Option<EventLoop>,
    running: Option<(CancellationToken, JoinHandle<EventLoop>)>,
}

/// RumqttTransport は 1 本の MQTT v5 接続
///
/// # 使用例
/// ```ignore
/// let (transport, events) = RumqttTransport::new(&config.mqtt);
/// let manager = ConnectionManager::new(Arc::new(transport), events, dispatcher, options);
/// ```
pub struct RumqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    driver: tokio::sync::Mutex<Driver>,
    /// Keeps `AckBook::expect()` order equal to client request order.
    publish_gate: tokio::sync::Mutex<()>,
    /// Held until the SubAck, so one subscription is in flight at a time.
    subscribe_gate: tokio::sync::Mutex<()>,
    publish_timeout: Duration,
    reconnect_delay: Duration,
}

impl RumqttTransport {
    pub fn new(settings: &MqttSettings) -> (Self, TransportEvents) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(settings), REQUEST_CAPACITY);
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            client,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                book: Mutex::new(AckBook::default()),
                subscriptions: Mutex::new(SubscribeBook::default()),
                events,
            }),
            driver: tokio::sync::Mutex::new(Driver {
                idle: Some(eventloop),
                running: None,
            }),
            publish_gate: tokio::sync::Mutex::new(()),
            subscribe_gate: tokio::sync::Mutex::new(()),
            publish_timeout: settings.publish_timeout(),
            reconnect_delay: settings.reconnect_delay(),
        };
        (transport, rx)
    }

    /// Publishes and subscriptions still waiting for the broker.
    pub fn pending_acks(&self) -> usize {
        self.shared.book().pending() + self.shared.subscriptions().pending()
    }
}

/// Poll the event loop until cancelled or a requested disconnect went out.
async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) -> EventLoop {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                shared.connected.store(true, Ordering::SeqCst);
                info!(session_present = ack.session_present, "mqtt connected");
                shared.emit(TransportEvent::Connected {
                    session_present: ack.session_present,
                });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                shared.emit(TransportEvent::Message(InboundMessage::new(
                    topic,
                    publish.payload.to_vec(),
                    publish.retain,
                    from_mqtt(publish.qos),
                )));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.book().acked(ack.pkid, puback_reason(ack.reason));
            }
            Ok(Event::Incoming(Packet::PubRec(rec))) => {
                // QoS 2 only completes on PubComp unless the broker refused here
                let reason = pubrec_reason(rec.reason);
                if !reason.is_success() {
                    shared.book().acked(rec.pkid, reason);
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.book().acked(comp.pkid, AckReason::Success);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                shared.subscriptions().acked(&ack);
            }
            Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                warn!(reason = ?disconnect.reason_code, "broker closed the connection");
                shared.lost(format!("{:?}", disconnect.reason_code));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.book().sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.subscriptions().sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.lost("normal disconnection".to_string());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let ConnectionError::MqttState(StateError::SubFail { reason }) = &e {
                    shared.subscriptions().refused(format!("{reason:?}"));
                }
                warn!(error = %e, delay = ?reconnect_delay, "mqtt connection error, reconnecting");
                shared.lost(e.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
    debug!("mqtt event loop stopped");
    eventloop
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut driver = self.driver.lock().await;
        if driver.running.is_some() {
            return Ok(());
        }
        let eventloop = driver
            .idle
            .take()
            .ok_or_else(|| TransportError::Client("event loop lost after a failed stop".to_string()))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(
            eventloop,
            Arc::clone(&self.shared),
            self.reconnect_delay,
            cancel.clone(),
        ));
        driver.running = Some((cancel, handle));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut driver = self.driver.lock().await;
        let Some((cancel, mut handle)) = driver.running.take() else {
            return Ok(());
        };

        let requested = self.is_connected() && self.client.disconnect().await.is_ok();
        if !requested {
            cancel.cancel();
        }
        let joined = match tokio::time::timeout(self.publish_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                handle.await
            }
        };
        let eventloop = joined.map_err(|e| TransportError::Client(e.to_string()))?;
        driver.idle = Some(eventloop);
        self.shared.lost("normal disconnection".to_string());
        Ok(())
    }

    /// Completes on the broker's SubAck, not when the request is queued.
    async fn subscribe(&self, filter: &TopicFilter, qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let _gate = self.subscribe_gate.lock().await;
        let (tx, rx) = oneshot::channel();
        self.shared.subscriptions().expect(filter, tx);
        if let Err(e) = self.client.subscribe(filter.as_str(), to_mqtt(qos)).await {
            self.shared.subscriptions().cancel_last();
            return Err(TransportError::Client(e.to_string()));
        }

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => Err(TransportError::Timeout(self.publish_timeout)),
        }
    }

    async fn publish(&self, intent: &PublishIntent) -> Result<AckReason, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            let _gate = self.publish_gate.lock().await;
            self.shared.book().expect(intent.qos, tx);
            let sent = self
                .client
                .publish_with_properties(
                    intent.topic.clone(),
                    to_mqtt(intent.qos),
                    intent.retained,
                    intent.payload.clone().unwrap_or_default(),
                    properties(intent),
                )
                .await;
            if let Err(e) = sent {
                self.shared.book().cancel_last();
                return Err(TransportError::Client(e.to_string()));
            }
        }

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => Err(TransportError::Timeout(self.publish_timeout)),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

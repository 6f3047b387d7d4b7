//! InMemoryTransport - テスト・デモ用のループバックブローカー
//!
//! # 学習ポイント
//! - Mutex で守った小さなブローカー状態（購読・retained・送信履歴）
//! - ロックは await をまたがない（状態更新はすべて同期的に済ませる）
//! - テストから接続断や拒否応答を注入できる

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::domain::errors::TransportError;
use crate::domain::message::{AckReason, InboundMessage, PublishIntent, QoS};
use crate::domain::topic::TopicFilter;
use crate::ports::{Transport, TransportEvent, TransportEvents};

#[derive(Default)]
struct BrokerState {
    connected: bool,
    subscriptions: Vec<(TopicFilter, QoS)>,
    retained: HashMap<String, Vec<u8>>,
    published: Vec<PublishIntent>,
    subscribe_calls: Vec<TopicFilter>,
    scripted_acks: VecDeque<AckReason>,
    refused_connects: u32,
    refused_subscribes: u32,
}

/// InMemoryTransport はプロセス内で完結するブローカー
///
/// # 実装詳細
/// - 自分の publish は自分の購読にもループバックする
/// - retained は topic ごとに最新 1 件。空ペイロードで削除
/// - 購読時に一致する retained メッセージを配信する
///
/// # 使用例
/// ```ignore
/// let (transport, events) = InMemoryTransport::new();
/// let transport = Arc::new(transport);
/// let manager = ConnectionManager::new(transport.clone(), events, dispatcher, options);
/// transport.drop_connection();
/// transport.restore_connection();
/// ```
pub struct InMemoryTransport {
    state: Mutex<BrokerState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl InMemoryTransport {
    pub fn new() -> (Self, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Mutex::new(BrokerState::default()),
            events,
        };
        (transport, rx)
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // nobody listening any more is fine
        let _ = self.events.send(event);
    }

    /// Simulate the network going away.
    pub fn drop_connection(&self) {
        self.state().connected = false;
        self.emit(TransportEvent::Disconnected {
            reason: "connection reset".to_string(),
        });
    }

    /// Simulate the automatic reconnect after [`Self::drop_connection`].
    pub fn restore_connection(&self) {
        self.state().connected = true;
        self.emit(TransportEvent::Connected {
            session_present: true,
        });
    }

    /// Deliver a message as if another client had published it.
    pub fn inject(&self, message: InboundMessage) {
        self.emit(TransportEvent::Message(message));
    }

    /// The broker answers the next publish with `reason` and drops it.
    pub fn reject_next_publish(&self, reason: AckReason) {
        self.state().scripted_acks.push_back(reason);
    }

    /// The next `n` connect attempts fail.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state().refused_connects = n;
    }

    /// The next `n` subscribe attempts are refused by the broker.
    pub fn refuse_next_subscribes(&self, n: u32) {
        self.state().refused_subscribes = n;
    }

    /// Accepted publishes, in order.
    pub fn published(&self) -> Vec<PublishIntent> {
        self.state().published.clone()
    }

    /// Subscriptions the broker accepted, in order.
    pub fn subscribe_calls(&self) -> Vec<TopicFilter> {
        self.state().subscribe_calls.clone()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            if state.connected {
                return Ok(());
            }
            if state.refused_connects > 0 {
                state.refused_connects -= 1;
                return Err(TransportError::Client("connection refused".to_string()));
            }
            state.connected = true;
        }
        self.emit(TransportEvent::Connected {
            session_present: false,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Ok(());
            }
            state.connected = false;
        }
        self.emit(TransportEvent::Disconnected {
            reason: "normal disconnection".to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &TopicFilter, qos: QoS) -> Result<(), TransportError> {
        let deliveries: Vec<InboundMessage> = {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if state.refused_subscribes > 0 {
                state.refused_subscribes -= 1;
                return Err(TransportError::SubscriptionRefused {
                    filter: filter.to_string(),
                    reason: "NotAuthorized".to_string(),
                });
            }
            state.subscribe_calls.push(filter.clone());
            if !state.subscriptions.iter().any(|(f, _)| f == filter) {
                state.subscriptions.push((filter.clone(), qos));
            }
            state
                .retained
                .iter()
                .filter(|(topic, _)| filter.matches(topic))
                .map(|(topic, payload)| InboundMessage::new(topic.clone(), payload.clone(), true, qos))
                .collect()
        };
        for message in deliveries {
            self.emit(TransportEvent::Message(message));
        }
        Ok(())
    }

    async fn publish(&self, intent: &PublishIntent) -> Result<AckReason, TransportError> {
        let (delivery, ack) = {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if let Some(reason) = state.scripted_acks.pop_front() {
                return Ok(reason);
            }

            state.published.push(intent.clone());
            let payload = intent.payload.clone().unwrap_or_default();
            if intent.retained {
                if payload.is_empty() {
                    state.retained.remove(&intent.topic);
                } else {
                    state.retained.insert(intent.topic.clone(), payload.clone());
                }
            }

            match state.subscriptions.iter().find(|(f, _)| f.matches(&intent.topic)) {
                Some((_, qos)) => (
                    Some(InboundMessage::new(intent.topic.clone(), payload, false, *qos)),
                    AckReason::Success,
                ),
                None => (None, AckReason::NoMatchingSubscribers),
            }
        };
        if let Some(message) = delivery {
            self.emit(TransportEvent::Message(message));
        }
        Ok(ack)
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

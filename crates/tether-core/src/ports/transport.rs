//! Transport port - ブローカーとの接続（MQTT または InMemory）
//!
//! Transport はトピックを解釈しない。受信したものはすべて
//! [`TransportEvent`] として channel に流すだけ。
//!
//! # 実装
//! - `impls::RumqttTransport`: MQTT v5（本番用）
//! - `impls::InMemoryTransport`: ループバック（テスト・デモ用）

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::errors::TransportError;
use crate::domain::message::{AckReason, InboundMessage, PublishIntent, QoS};
use crate::domain::topic::TopicFilter;

/// What the transport observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted a (re)connect.
    Connected { session_present: bool },
    /// The connection dropped or was closed.
    Disconnected { reason: String },
    Message(InboundMessage),
}

/// Receiving half handed out by a transport constructor.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport は単一のブローカー接続
///
/// # 設計原則
/// - `connect()` は接続処理を始めるだけ。完了は `TransportEvent::Connected` で届く
/// - 再接続は実装側が行い、そのたびに `Connected` を流す
/// - `publish()` はブローカーの応答（または QoS 0 なら送信完了）まで待つ
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close with a normal-disconnect reason code.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &TopicFilter, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, intent: &PublishIntent) -> Result<AckReason, TransportError>;

    fn is_connected(&self) -> bool;
}

//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **RumqttTransport**: MQTT v5 ブローカー接続（本番用）
//! - **InMemoryTransport**: ループバックブローカー（テスト・デモ用）
//! - **InMemoryEngine**: ワークフローエンジンの代役（テスト・デモ用）

pub mod inmem_engine;
pub mod inmem_transport;
pub mod rumqtt;

pub use self::inmem_engine::InMemoryEngine;
pub use self::inmem_transport::InMemoryTransport;
pub use self::rumqtt::RumqttTransport;

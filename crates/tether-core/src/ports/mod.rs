//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（MQTT ブローカー、ワークフローエンジン）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ブローカーが配信の正本（retained メッセージ）
//! - エンジンが実行状態の正本。こちらは観測と終了要求だけ

pub mod engine;
pub mod hooks;
pub mod publisher;
pub mod transport;

pub use self::engine::WorkflowEngine;
pub use self::hooks::LifecycleHooks;
pub use self::publisher::{InstancePersistence, Publisher};
pub use self::transport::{Transport, TransportEvent, TransportEvents};

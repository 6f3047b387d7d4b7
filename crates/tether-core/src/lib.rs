//! tether-core
//!
//! Core building blocks for mirroring workflow state over MQTT v5.
//!
//! # モジュール構成
//! - **config**: YAML 設定（MirrorConfig）と起動時検証
//! - **domain**: ドメインモデル（topic, ids, message, workflow, events, errors）
//! - **ports**: 抽象化レイヤー（Transport, WorkflowEngine, Publisher, LifecycleHooks）
//! - **app**: アプリケーションロジック（builder, connection, dispatcher, replicator, reconciler）
//! - **typed**: 型付き Payload API（WorkflowData, PayloadCodec, JsonHandler, ConsumerRegistry）
//! - **impls**: 実装（RumqttTransport と、開発・テスト用の InMemory 実装）
//!
//! # データの流れ
//! ```text
//! engine hooks ─▶ StateReplicator ─▶ ConnectionManager ─▶ broker
//! broker ─▶ ConnectionManager ─▶ Dispatcher ─▶ consumers
//! engine step errors ─▶ TerminationReconciler ─▶ engine.terminate_workflow
//! ```

pub mod config;
pub mod domain;
pub mod ports;
pub mod app;
pub mod typed;
pub mod impls;

//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **ConnectionManager**: ブローカー接続・購読の記憶と再購読・送信
//! - **Dispatcher**: 受信メッセージを一致する consumer へ並行に配る
//! - **StateReplicator**: インスタンスの状態を active / final トピックへ複製
//! - **TerminationReconciler**: Abort されたワークフローの終了をやり直し続ける
//! - **ReplicationHooks**: エンジンのライフサイクルフックから複製を呼ぶ
//! - **WorkflowInstanceConsumer**: 他プロセスが公開したインスタンスの取り込み

pub mod builder;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod hooks;
pub mod reconciler;
pub mod replicator;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::connection::{ConnectionManager, ConnectionOptions};
pub use self::consumers::WorkflowInstanceConsumer;
pub use self::dispatcher::Dispatcher;
pub use self::hooks::ReplicationHooks;
pub use self::reconciler::{PendingTerminations, TerminationReconciler};
pub use self::replicator::{RetentionPolicy, StateReplicator};
pub use self::status::MirrorStatus;

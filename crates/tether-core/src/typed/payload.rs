//! WorkflowPayload trait - ワークフローの Data に載せる型
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`) を型の判別子に使う
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// WorkflowPayload は Data の型と判別子を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderData {
///     order_id: String,
/// }
///
/// impl WorkflowPayload for OrderData {
///     const TYPE: &'static str = "shop.order.v1";
/// }
/// ```
///
/// # 命名規約
/// - `{namespace}.{domain}.v{major}`
/// - 判別子はワイヤに載るので、Rust の型名ではなく安定した名前にする
pub trait WorkflowPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

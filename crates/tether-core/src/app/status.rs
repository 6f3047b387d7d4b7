//! Status - 稼働状況のスナップショット
//!
//! CLI やヘルスチェックが JSON で出力できるよう Serialize を実装する。

use serde::Serialize;

use crate::domain::ids::WorkflowId;

/// MirrorStatus はある時点の稼働状況
///
/// # 使用例
/// ```ignore
/// let status = app.status().await;
/// println!("{}", serde_json::to_string_pretty(&status)?);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStatus {
    /// Connected, and all remembered filters subscribed.
    pub connected: bool,
    pub subscriptions: Vec<String>,
    pub consumers: Vec<String>,
    pub in_flight_handlers: usize,
    pub pending_terminations: Vec<WorkflowId>,
}

impl MirrorStatus {
    /// Nothing left to do: no handler running and no termination outstanding.
    pub fn is_idle(&self) -> bool {
        self.in_flight_handlers == 0 && self.pending_terminations.is_empty()
    }
}

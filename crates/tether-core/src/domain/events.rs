//! Events - エンジンから届くステップエラー通知
//!
//! # 学習ポイント
//! - エンジンのイベントは broadcast で配られ、購読者ごとに Receiver を持つ
//! - Abort だけが終了要求の対象。それ以外のエラーはエンジン側のリトライに任せる

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::WorkflowId;

/// Which step raised the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// StepErrorKind はステップエラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepErrorKind {
    /// The step asked for the whole workflow to be terminated.
    Abort,
    /// Ordinary step failure, handled by the engine's own retry policy.
    Failure,
    /// The step ran past its deadline.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Abort,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Failure,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// StepErrorEvent はエンジンがステップ失敗時に発行するイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorEvent {
    pub workflow_id: WorkflowId,
    pub step: StepInfo,
    pub error: StepError,
}

impl StepErrorEvent {
    pub fn new(workflow_id: WorkflowId, step: StepInfo, error: StepError) -> Self {
        Self {
            workflow_id,
            step,
            error,
        }
    }

    /// Is this the signal that the workflow must be terminated?
    pub fn is_abort(&self) -> bool {
        self.error.kind == StepErrorKind::Abort
    }
}

//! Errors - エラー型と分類
//!
//! # 分類
//! - **TransportError**: 送れなかった（未接続・切断・タイムアウト）
//! - **MirrorError::Communication**: 送れたがブローカーに拒否された
//! - **RegistryError / ConfigError**: 起動時に止めるべき誤り
//! - **HandlerError / EngineError**: ログに残して先へ進む

use thiserror::Error;

use crate::config::ConfigError;
use crate::typed::{CodecError, RegistryError};

use super::topic::TopicError;

/// ErrorKind は運用上の分類
///
/// - Transient: 再接続や次の周期で解消しうる
/// - Rejected: ブローカーが明示的に拒否した。自動リトライしない
/// - Fatal: 設定・登録の誤り。起動を止める
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Rejected,
    Fatal,
}

/// Transport-level failure: the message was not (confirmed) sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("connection lost before the broker acknowledged")]
    ConnectionLost,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("mqtt client: {0}")]
    Client(String),

    #[error("broker refused subscription to '{filter}': {reason}")]
    SubscriptionRefused { filter: String, reason: String },

    #[error("cancelled")]
    Cancelled,
}

/// Error returned by a dispatched consumer. Only ever logged.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload: {0}")]
    Payload(#[from] CodecError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("workflow instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// MirrorError は公開 API が返すエラー
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("connection: {0}")]
    Connection(#[from] TransportError),

    #[error("broker rejected publish to '{topic}': {reason}")]
    Communication { topic: String, reason: String },

    #[error(transparent)]
    Registration(#[from] RegistryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::Connection(_) => ErrorKind::Transient,
            MirrorError::Communication { .. } => ErrorKind::Rejected,
            MirrorError::Codec(_) | MirrorError::Topic(_) => ErrorKind::Rejected,
            MirrorError::Registration(_) | MirrorError::Config(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

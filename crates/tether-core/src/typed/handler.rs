//! Handler trait - 受信メッセージを処理する Handler の定義
//!
//! # 学習ポイント
//! - Object-safe trait (MessageHandler) と factory による毎回の生成
//! - ジェネリック trait (JsonHandler<T>) とデコードを肩代わりするアダプタ
//! - Type erasure パターン (Json<T, H> → MessageHandler)

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

use super::codec::PayloadCodec;
use crate::domain::errors::HandlerError;
use crate::domain::message::InboundMessage;

/// MessageHandler は 1 件の受信メッセージを処理する
///
/// インスタンスは呼び出しごとに [`HandlerFactory`] から作られ、
/// 呼び出しをまたいで状態を持たない。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<InboundMessage>) -> Result<(), HandlerError>;
}

/// HandlerFactory は呼び出しごとに新しい Handler を作る
///
/// クロージャ `|| MyHandler::new(deps.clone())` もそのまま factory になる。
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn MessageHandler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> H + Send + Sync,
    H: MessageHandler + 'static,
{
    fn create(&self) -> Box<dyn MessageHandler> {
        Box::new(self())
    }
}

/// JsonHandler は JSON ペイロードを `T` として受け取る
///
/// # ジェネリクスによる型安全性
/// - デコードは [`Json`] アダプタが済ませる
/// - tombstone（空ペイロード）は Handler まで届かない
#[async_trait]
pub trait JsonHandler<T>: Send + Sync
where
    T: DeserializeOwned + Send + 'static,
{
    async fn handle(&self, topic: &str, value: T) -> Result<(), HandlerError>;
}

/// Adapts a [`JsonHandler<T>`] into a [`MessageHandler`].
pub struct Json<T, H> {
    handler: H,
    codec: PayloadCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> Json<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: JsonHandler<T>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            codec: PayloadCodec,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> MessageHandler for Json<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: JsonHandler<T>,
{
    async fn handle(&self, message: Arc<InboundMessage>) -> Result<(), HandlerError> {
        if message.is_tombstone() {
            tracing::debug!(topic = message.topic(), "ignoring tombstone");
            return Ok(());
        }
        let value: T = self.codec.decode(message.payload())?;
        self.handler.handle(message.topic(), value).await
    }
}

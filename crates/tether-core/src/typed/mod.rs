//! Typed - 型付きペイロードと Handler の API
//!
//! # 二層構造
//! - **表層（Typed）**: `WorkflowPayload`, `JsonHandler<T>` - 型安全
//! - **内部（Dyn）**: `MessageHandler`, `HandlerFactory` - object-safe, type erasure

pub mod codec;
pub mod data;
pub mod handler;
pub mod payload;
pub mod registry;

pub use self::codec::{CodecError, PayloadCodec};
pub use self::data::{TYPE_PROPERTY, WorkflowData};
pub use self::handler::{HandlerFactory, Json, JsonHandler, MessageHandler};
pub use self::payload::WorkflowPayload;
pub use self::registry::{ConsumerRegistry, Registration, RegistryError};

//! Domain model (ids, topics, messages, workflow snapshots, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod topic;
pub mod workflow;

pub use self::errors::{EngineError, ErrorKind, HandlerError, MirrorError, TransportError};
pub use self::events::{StepError, StepErrorEvent, StepErrorKind, StepInfo};
pub use self::ids::{Reference, WorkflowId};
pub use self::message::{AckReason, InboundMessage, PublishIntent, QoS};
pub use self::topic::{StatusSegment, TopicError, TopicFilter, TopicScheme};
pub use self::workflow::{ExecutionPointer, PointerStatus, WorkflowInstance, WorkflowStatus};

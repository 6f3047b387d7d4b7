//! Messages crossing the broker boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Delivery guarantee of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// One delivery received from the broker.
///
/// Created once per delivery and never mutated; the dispatcher shares it
/// between handlers behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
    retained: bool,
    qos: QoS,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retained: bool, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
            qos,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn retained(&self) -> bool {
        self.retained
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Retained deliveries with no payload are deletions, not data.
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// What to publish, before it reaches a transport.
///
/// `payload == None` together with `retained == true` is a tombstone: the
/// broker drops whatever was retained on the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishIntent {
    pub topic: String,
    pub payload: Option<Vec<u8>>,
    pub retained: bool,
    pub expiry: Option<Duration>,
    pub qos: QoS,
    pub content_type: Option<String>,
}

impl PublishIntent {
    pub const JSON: &'static str = "application/json";

    pub fn json(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload: Some(payload),
            retained: false,
            expiry: None,
            qos: QoS::AtLeastOnce,
            content_type: Some(Self::JSON.to_string()),
        }
    }

    pub fn tombstone(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: None,
            retained: true,
            expiry: None,
            qos: QoS::AtLeastOnce,
            content_type: Some(Self::JSON.to_string()),
        }
    }

    pub fn retained(mut self) -> Self {
        self.retained = true;
        self
    }

    pub fn expires_after(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.retained && self.payload.is_none()
    }

    /// Expiry in whole seconds as carried by MQTT v5 (saturating).
    pub fn expiry_secs(&self) -> Option<u32> {
        self.expiry
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
    }
}

/// Broker verdict on a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckReason {
    Success,
    NoMatchingSubscribers,
    Rejected(String),
}

impl AckReason {
    pub fn is_success(&self) -> bool {
        matches!(self, AckReason::Success | AckReason::NoMatchingSubscribers)
    }
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckReason::Success => f.write_str("Success"),
            AckReason::NoMatchingSubscribers => f.write_str("NoMatchingSubscribers"),
            AckReason::Rejected(reason) => f.write_str(reason),
        }
    }
}

//! PayloadCodec - ワークフローインスタンスと JSON バイト列の相互変換

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::workflow::WorkflowInstance;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("data has type '{found}', expected '{expected}'")]
    TypeMismatch { expected: String, found: String },
}

/// PayloadCodec は MQTT ペイロードの JSON 表現を扱う
///
/// Enum は名前で、null のフィールドは省略して書き出す
/// （各型の serde 属性で決まる）。
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode_instance(&self, instance: &WorkflowInstance) -> Result<Vec<u8>, CodecError> {
        self.encode(instance)
    }

    pub fn decode_instance(&self, bytes: &[u8]) -> Result<WorkflowInstance, CodecError> {
        self.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{Reference, WorkflowId};
    use crate::domain::workflow::{ExecutionPointer, PointerStatus, WorkflowStatus};
    use crate::typed::{WorkflowData, WorkflowPayload};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl WorkflowPayload for Counter {
        const TYPE: &'static str = "test.counter.v1";
    }

    #[test]
    fn instance_round_trips_with_typed_data() {
        let codec = PayloadCodec;
        let mut instance = WorkflowInstance::new(
            WorkflowId::new("wf-7"),
            "Counting",
            2,
            WorkflowData::from_payload(&Counter { value: 5 }).unwrap(),
        );
        instance.reference = Reference::new("0f8fad5b-d9cb");
        instance.execution_pointers.push(ExecutionPointer {
            id: "p-1".into(),
            step_id: 0,
            step_name: Some("Init".into()),
            active: false,
            status: PointerStatus::Complete,
            start_time: None,
            end_time: None,
            retry_count: 0,
        });

        let bytes = codec.encode_instance(&instance).unwrap();
        let back = codec.decode_instance(&bytes).unwrap();

        assert_eq!(back, instance);
        assert_eq!(back.data.decode::<Counter>().unwrap(), Counter { value: 5 });
    }

    #[test]
    fn decodes_instances_with_legacy_status_ordinals() {
        let json = br#"{
            "id": "wf-1",
            "workflowDefinitionId": "Simple",
            "version": 1,
            "reference": "abc",
            "status": 2,
            "createTime": "2024-01-01T00:00:00Z"
        }"#;

        let instance = PayloadCodec.decode_instance(json).unwrap();

        assert_eq!(instance.status, WorkflowStatus::Complete);
        assert!(instance.data.is_empty());
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(matches!(
            PayloadCodec.decode_instance(b""),
            Err(CodecError::EmptyPayload)
        ));
    }
}

//! WorkflowData - 型判別子つきの Data
//!
//! ワイヤ上では `$type` プロパティを持つ JSON オブジェクト。
//! プリミティブ（文字列・数値・真偽値・配列）には判別子を付けない。
//!
//! # 学習ポイント
//! - Serialize / Deserialize の手書き実装
//! - 判別子の付け外しはシリアライズ境界だけで行い、メモリ上は enum で持つ

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::codec::CodecError;
use super::payload::WorkflowPayload;

/// Reserved property carrying the type discriminator.
pub const TYPE_PROPERTY: &str = "$type";

/// Data attached to a workflow instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkflowData {
    /// No data (`null` on the wire).
    #[default]
    Empty,
    /// A value that is not an object; written as-is.
    Primitive(Value),
    /// An object whose producer declared its type.
    Typed {
        type_name: String,
        fields: Map<String, Value>,
    },
    /// An object that arrived without a discriminator.
    Untyped(Map<String, Value>),
}

impl WorkflowData {
    /// Wrap a typed payload, remembering its discriminator.
    pub fn from_payload<T: WorkflowPayload>(payload: &T) -> Result<Self, CodecError> {
        let value = serde_json::to_value(payload)?;
        Ok(match value {
            Value::Object(mut fields) => {
                fields.remove(TYPE_PROPERTY);
                WorkflowData::Typed {
                    type_name: T::TYPE.to_string(),
                    fields,
                }
            }
            other => Self::classify(other),
        })
    }

    /// Recover the concrete payload.
    ///
    /// A typed object only decodes into the type that produced it. Untyped
    /// objects and primitives are decoded structurally.
    pub fn decode<T: WorkflowPayload>(&self) -> Result<T, CodecError> {
        let value = match self {
            WorkflowData::Typed { type_name, fields } => {
                if type_name != T::TYPE {
                    return Err(CodecError::TypeMismatch {
                        expected: T::TYPE.to_string(),
                        found: type_name.clone(),
                    });
                }
                Value::Object(fields.clone())
            }
            WorkflowData::Untyped(fields) => Value::Object(fields.clone()),
            WorkflowData::Primitive(value) => value.clone(),
            WorkflowData::Empty => Value::Null,
        };
        Ok(serde_json::from_value(value)?)
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            WorkflowData::Typed { type_name, .. } => Some(type_name),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, WorkflowData::Empty)
    }

    fn classify(value: Value) -> Self {
        match value {
            Value::Null => WorkflowData::Empty,
            Value::Object(mut fields) => match fields.remove(TYPE_PROPERTY) {
                Some(Value::String(type_name)) => WorkflowData::Typed { type_name, fields },
                Some(other) => {
                    // not a discriminator we wrote; keep it as data
                    fields.insert(TYPE_PROPERTY.to_string(), other);
                    WorkflowData::Untyped(fields)
                }
                None => WorkflowData::Untyped(fields),
            },
            other => WorkflowData::Primitive(other),
        }
    }
}

impl Serialize for WorkflowData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkflowData::Empty => serializer.serialize_unit(),
            WorkflowData::Primitive(value) => value.serialize(serializer),
            WorkflowData::Untyped(fields) => fields.serialize(serializer),
            WorkflowData::Typed { type_name, fields } => {
                let mut map = serializer.serialize_map(Some(fields.len() + 1))?;
                map.serialize_entry(TYPE_PROPERTY, type_name)?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for WorkflowData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderData {
        order_id: String,
        amount: u32,
    }

    impl WorkflowPayload for OrderData {
        const TYPE: &'static str = "test.order.v1";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RefundData {
        order_id: String,
    }

    impl WorkflowPayload for RefundData {
        const TYPE: &'static str = "test.refund.v1";
    }

    #[test]
    fn typed_data_writes_discriminator_first() {
        let data = WorkflowData::from_payload(&OrderData {
            order_id: "o-1".into(),
            amount: 3,
        })
        .unwrap();

        let text = serde_json::to_string(&data).unwrap();
        assert!(text.starts_with("{\"$type\":\"test.order.v1\""), "{text}");
    }

    #[test]
    fn typed_data_survives_the_wire_as_the_same_type() {
        let order = OrderData {
            order_id: "o-1".into(),
            amount: 3,
        };
        let text = serde_json::to_string(&WorkflowData::from_payload(&order).unwrap()).unwrap();

        let back: WorkflowData = serde_json::from_str(&text).unwrap();

        assert_eq!(back.type_name(), Some(OrderData::TYPE));
        assert_eq!(back.decode::<OrderData>().unwrap(), order);
    }

    #[test]
    fn typed_data_refuses_a_different_type() {
        let data = WorkflowData::from_payload(&OrderData {
            order_id: "o-1".into(),
            amount: 3,
        })
        .unwrap();

        let err = data.decode::<RefundData>().unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn primitives_carry_no_discriminator() {
        let data: WorkflowData = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(data, WorkflowData::Primitive(json!(42)));
        assert_eq!(serde_json::to_value(&data).unwrap(), json!(42));

        let data: WorkflowData = serde_json::from_value(json!(null)).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn objects_without_discriminator_stay_generic() {
        let data: WorkflowData = serde_json::from_value(json!({"order_id": "o-2", "amount": 1})).unwrap();
        assert!(matches!(data, WorkflowData::Untyped(_)));
        assert_eq!(data.type_name(), None);

        // structural decoding still works for untyped objects
        let order: OrderData = data.decode().unwrap();
        assert_eq!(order.order_id, "o-2");
    }
}

//! Twin, data and state messages exchanged with the cloud side.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;

/// Fields shared by every event-bus message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMessage {
    #[serde(default)]
    pub event_id: String,

    /// Unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl BaseMessage {
    /// A base message stamped with the current time.
    pub fn now() -> Self {
        Self {
            event_id: String::new(),
            timestamp: current_timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    #[serde(default)]
    pub timestamp: i64,
}

/// A single twin value (expected or actual).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ValueMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMetadata {
    #[serde(rename = "type", default)]
    pub value_type: String,
}

/// One twin entry inside a twin message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgTwin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<TwinValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<TwinValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TypeMetadata>,
}

/// Inbound desired-state change for one device.
///
/// Only `delta` drives reconciliation; `twin` is carried for completeness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTwinDelta {
    #[serde(flatten)]
    pub base: BaseMessage,

    #[serde(default)]
    pub twin: HashMap<String, MsgTwin>,

    #[serde(default)]
    pub delta: BTreeMap<String, String>,
}

impl DeviceTwinDelta {
    /// Build a delta from `(property, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            base: BaseMessage::now(),
            twin: HashMap::new(),
            delta: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Reported twin values published by the mapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTwinUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,

    #[serde(default)]
    pub twin: HashMap<String, MsgTwin>,
}

impl DeviceTwinUpdate {
    /// A twin update carrying one actual value.
    pub fn actual(name: impl Into<String>, value_type: impl Into<String>, value: String) -> Self {
        let base = BaseMessage::now();
        let twin = MsgTwin {
            actual: Some(TwinValue {
                value: Some(value),
                metadata: Some(ValueMetadata {
                    timestamp: base.timestamp,
                }),
            }),
            metadata: Some(TypeMetadata {
                value_type: value_type.into(),
            }),
            ..Default::default()
        };

        Self {
            base,
            twin: HashMap::from([(name.into(), twin)]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMetadata {
    #[serde(default)]
    pub timestamp: i64,

    #[serde(rename = "type", default)]
    pub value_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataValue {
    pub value: String,

    #[serde(default)]
    pub metadata: DataMetadata,
}

/// Aggregate sensor readings published by the mapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    #[serde(flatten)]
    pub base: BaseMessage,

    #[serde(default)]
    pub data: HashMap<String, DataValue>,
}

impl DeviceData {
    /// A data message carrying one reading.
    pub fn single(name: impl Into<String>, value_type: impl Into<String>, value: String) -> Self {
        let base = BaseMessage::now();
        let entry = DataValue {
            value,
            metadata: DataMetadata {
                timestamp: base.timestamp,
                value_type: value_type.into(),
            },
        };

        Self {
            base,
            data: HashMap::from([(name.into(), entry)]),
        }
    }
}

/// Reachability state published by the status probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,

    #[serde(default)]
    pub state: String,
}

impl DeviceStateUpdate {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            base: BaseMessage::now(),
            state: state.into(),
        }
    }
}

/// Encode a message as JSON bytes.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a message from JSON bytes.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Messages exchanged with the network gateway.

use pointbridge_core::PointId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Encoding of gateway payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadFormat {
    /// UTF-8 JSON
    #[default]
    Json,
    /// CBOR, for constrained carriers
    Cbor,
}

impl PayloadFormat {
    /// Encode `message`.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode<T: Serialize>(self, message: &T) -> Result<Vec<u8>, MessageError> {
        match self {
            Self::Json => serde_json::to_vec(message).map_err(|e| MessageError::Serialize(e.to_string())),
            Self::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(message, &mut bytes)
                    .map_err(|e| MessageError::Serialize(e.to_string()))?;
                Ok(bytes)
            }
        }
    }

    /// Decode `bytes`.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid message in this format.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, MessageError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string())),
            Self::Cbor => ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string())),
        }
    }
}

impl std::str::FromStr for PayloadFormat {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(MessageError::UnknownFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

/// Operation requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Read the present value
    Read,
    /// Command a priority slot
    Write,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Write => write!(f, "write"),
        }
    }
}

/// Outbound request forwarded to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    /// Requested operation
    pub action: Action,
    /// Target point
    pub point_id: PointId,
    /// Correlation id
    pub request_id: String,
    /// Write priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    /// Write value; `Some(Value::Null)` relinquishes
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Issue time in milliseconds since UNIX epoch
    pub timestamp: i64,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TransportRequest {
    /// Build a read request stamped with the current time.
    #[must_use]
    pub fn read(point_id: PointId, request_id: impl Into<String>) -> Self {
        Self {
            action: Action::Read,
            point_id,
            request_id: request_id.into(),
            priority: None,
            value: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build a write request stamped with the current time.
    #[must_use]
    pub fn write(
        point_id: PointId,
        request_id: impl Into<String>,
        priority: Value,
        value: Value,
    ) -> Self {
        Self {
            action: Action::Write,
            priority: Some(priority),
            value: Some(value),
            ..Self::read(point_id, request_id)
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        PayloadFormat::Json.encode(self)
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        PayloadFormat::Json.decode(bytes)
    }
}

/// Inbound answer from the transport.
///
/// Gateways are inconsistent about layout: the point id may sit at the top
/// level or inside a `network` or `status` envelope, and the value may be
/// called `value` or `payload`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportResponse {
    /// Point the answer refers to
    pub point_id: PointId,
    /// Correlation id echoed by the gateway, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Returned value (null on error)
    pub value: Value,
    /// Error text when the gateway reported a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const ENVELOPES: [&str; 2] = ["network", "status"];

impl TransportResponse {
    /// Successful answer.
    #[must_use]
    pub fn success(point_id: PointId, request_id: Option<String>, value: Value) -> Self {
        Self {
            point_id,
            request_id,
            value,
            error: None,
        }
    }

    /// Failed answer.
    #[must_use]
    pub fn failure(point_id: PointId, request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            point_id,
            request_id,
            value: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Whether the gateway reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Interpret a decoded message. Returns `None` when no point id can be
    /// found, in which case the message is not a response.
    #[must_use]
    pub fn parse(message: &Value) -> Option<Self> {
        let root = message.as_object()?;
        let body = std::iter::once(root)
            .chain(
                ENVELOPES
                    .iter()
                    .filter_map(|key| root.get(*key).and_then(Value::as_object)),
            )
            .find(|obj| obj.get("pointId").and_then(parse_point_id).is_some())?;
        let point_id = body.get("pointId").and_then(parse_point_id)?;

        let field = |key: &str| body.get(key).or_else(|| root.get(key));

        let value = field("value")
            .or_else(|| field("payload"))
            .cloned()
            .unwrap_or(Value::Null);
        let request_id = field("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let error = error_text(body).or_else(|| error_text(root));

        Some(Self {
            point_id,
            request_id,
            value: if error.is_some() { Value::Null } else { value },
            error,
        })
    }

    /// Decode JSON bytes and interpret them.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not JSON. Valid JSON without a point id
    /// yields `Ok(None)`.
    pub fn from_json(bytes: &[u8]) -> Result<Option<Self>, MessageError> {
        let message: Value = PayloadFormat::Json.decode(bytes)?;
        Ok(Self::parse(&message))
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        PayloadFormat::Json.encode(self)
    }
}

fn parse_point_id(value: &Value) -> Option<PointId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| PointId::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn error_text(obj: &Map<String, Value>) -> Option<String> {
    let message = || {
        ["message", "errorMessage"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map_or_else(|| "error".to_string(), str::to_string)
    };
    match obj.get("error")? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Bool(true) => Some(message()),
        Value::Object(inner) => Some(
            inner
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(message, str::to_string),
        ),
        _ => None,
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Unknown payload format name
    #[error("unknown payload format '{0}', expected 'json' or 'cbor'")]
    UnknownFormat(String),
}

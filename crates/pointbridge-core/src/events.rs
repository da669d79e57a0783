//! Payloads carried on the in-process event bus.

use crate::priority::PriorityState;
use crate::registry::PointId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name for remote read requests.
pub const READ_REQUEST: &str = "pointReference:read";
/// Event name for remote write requests.
pub const WRITE_REQUEST: &str = "pointWrite:write";
/// Event name for read responses.
pub const READ_RESPONSE: &str = "pointReference:response";
/// Event name for write responses.
pub const WRITE_RESPONSE: &str = "pointWrite:response";
/// Event name for priority state change broadcasts.
pub const GLOBAL_UPDATE: &str = "global-update";

/// Request to read a point through the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    /// Point to read
    pub point_id: PointId,
    /// Node that receives the response
    pub source_node_id: String,
}

/// Request to command a point.
///
/// Fields are optional because requests arrive from loosely typed flows;
/// validation happens in the writer. `value: Some(Value::Null)` is an explicit
/// relinquish, `value: None` means the property was missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    /// Point to command
    #[serde(default)]
    pub point_id: Option<PointId>,
    /// `"default"` or a level 1..=16 (number or string)
    #[serde(default)]
    pub priority: Option<Value>,
    /// Commanded value
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Node that receives the response
    #[serde(default)]
    pub source_node_id: String,
}

impl WriteRequest {
    /// A complete write request.
    #[must_use]
    pub fn new(
        point_id: PointId,
        priority: impl Into<Value>,
        value: Value,
        source_node_id: impl Into<String>,
    ) -> Self {
        Self {
            point_id: Some(point_id),
            priority: Some(priority.into()),
            value: Some(value),
            source_node_id: source_node_id.into(),
        }
    }
}

/// Keeps an explicit JSON `null` as `Some(Value::Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// How a bridged request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResponseOutcome {
    /// The transport answered with a value
    Success {
        /// Returned value (may be null)
        value: Value,
    },
    /// The transport answered with an error
    Error {
        /// Error text from the transport
        message: String,
    },
    /// No answer arrived in time
    Timeout,
}

/// Response delivered to the node that issued a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointResponse {
    /// Point the response refers to
    pub point_id: PointId,
    /// Correlation id of the settled request
    pub request_id: String,
    /// Node that issued the request
    pub target_node_id: String,
    /// Result
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
    /// Whether the request was issued during the startup grace window
    pub startup_phase: bool,
}

impl PointResponse {
    /// Whether the response carries a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Success { .. })
    }
}

/// Broadcast after a priority state was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Store namespace
    pub store: String,
    /// Key inside the store
    pub path: String,
    /// Full state after arbitration
    pub state: PriorityState,
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// `pointReference:read`
    ReadRequest(ReadRequest),
    /// `pointWrite:write`
    WriteRequest(WriteRequest),
    /// `pointReference:response`
    ReadResponse(PointResponse),
    /// `pointWrite:response`
    WriteResponse(PointResponse),
    /// `global-update`
    GlobalUpdate(StateUpdate),
}

impl BusEvent {
    /// Event name the payload is published under.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadRequest(_) => READ_REQUEST,
            Self::WriteRequest(_) => WRITE_REQUEST,
            Self::ReadResponse(_) => READ_RESPONSE,
            Self::WriteResponse(_) => WRITE_RESPONSE,
            Self::GlobalUpdate(_) => GLOBAL_UPDATE,
        }
    }

    /// The response payload, for either response event.
    #[must_use]
    pub fn as_response(&self) -> Option<&PointResponse> {
        match self {
            Self::ReadResponse(resp) | Self::WriteResponse(resp) => Some(resp),
            _ => None,
        }
    }
}

//! Error taxonomy shared by every point access path.

use crate::registry::PointId;
use serde_json::Value;

/// Errors raised while claiming, reading, or writing a point.
///
/// The display strings are the operator-facing status texts, so they stay
/// stable across releases.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PointError {
    /// The request is missing `pointId`, `priority`, or `value`
    #[error("Invalid msg properties")]
    InvalidMessage {
        /// Point id, when one was supplied
        point_id: Option<PointId>,
    },
    /// No registration (or no path) exists for the id on the write path
    #[error("Unknown ID")]
    UnknownId {
        /// Requested point
        point_id: PointId,
    },
    /// The registration does not allow writes
    #[error("Not Writable")]
    NotWritable {
        /// Requested point
        point_id: PointId,
    },
    /// The state store has no (readable) record for the point
    #[error("Point Not Found")]
    PointNotFound {
        /// Requested point
        point_id: PointId,
    },
    /// The value's JSON type differs from the declared point type
    #[error("Type Mismatch")]
    TypeMismatch {
        /// Requested point
        point_id: PointId,
        /// Declared type
        expected: String,
        /// Type of the rejected value
        actual: String,
    },
    /// Priority is neither `"default"` nor an integer in 1..=16
    #[error("Invalid Priority")]
    InvalidPriority {
        /// Requested point
        point_id: PointId,
        /// The rejected priority as received
        priority: String,
    },
    /// No registration exists for the id on the read path
    #[error("Point Not Registered")]
    PointNotRegistered {
        /// Requested point
        point_id: PointId,
    },
    /// The id is already claimed by another owner
    #[error("ID Conflict")]
    RegistrationConflict {
        /// Requested point
        point_id: PointId,
        /// Owner holding the registration
        owner_id: String,
    },
    /// The state store rejected a read or write
    #[error("store error: {message}")]
    Store {
        /// Requested point
        point_id: PointId,
        /// Underlying store failure
        message: String,
    },
}

impl PointError {
    /// Rejection of `raw` as a write priority. String priorities are kept
    /// without their JSON quotes.
    #[must_use]
    pub fn invalid_priority(point_id: PointId, raw: &Value) -> Self {
        let priority = match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::InvalidPriority { point_id, priority }
    }

    /// The point the error refers to, if known.
    #[must_use]
    pub fn point_id(&self) -> Option<PointId> {
        match self {
            Self::InvalidMessage { point_id } => *point_id,
            Self::UnknownId { point_id }
            | Self::NotWritable { point_id }
            | Self::PointNotFound { point_id }
            | Self::TypeMismatch { point_id, .. }
            | Self::InvalidPriority { point_id, .. }
            | Self::PointNotRegistered { point_id }
            | Self::RegistrationConflict { point_id, .. }
            | Self::Store { point_id, .. } => Some(*point_id),
        }
    }

    /// Whether the error reflects static configuration rather than transport
    /// availability. These are reported even during a startup grace window.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::RegistrationConflict { .. } | Self::NotWritable { .. } | Self::TypeMismatch { .. }
        )
    }
}

/// Errors from a [`SharedStateStore`](crate::store::SharedStateStore) backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend I/O or query failure
    #[error("backend error: {0}")]
    Backend(String),
    /// State could not be encoded for storage
    #[error("encode error: {0}")]
    Encode(String),
}

//! Bridge state machine.
//!
//! Turns fire-and-forget bus requests into correlated transport exchanges:
//!
//! ```text
//! issued -> pending -> resolved
//!                   \-> timed out
//! ```
//!
//! The bridge never retries. A requester that wants another attempt issues a
//! new request, which gets a new correlation id. Time is passed in by the
//! caller so the machine stays deterministic under test.

use crate::pending::{PendingTable, RequestKind, RequestState};
use pointbridge_core::{
    BusEvent, PointError, PointId, PointResponse, ReadRequest, ResponseOutcome, WriteRequest,
    WritePriority,
};
use pointbridge_proto::{TransportRequest, TransportResponse};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Bridge timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long a request waits for an answer
    pub request_timeout: Duration,
    /// Window after start in which transport failures are not reported
    pub startup_grace: Duration,
}

impl BridgeConfig {
    /// How long a poller should wait on an unanswered read before issuing
    /// another one.
    ///
    /// Outlives the bridge's own timeout by one poll interval, so the old
    /// request has always left the pending table by then.
    #[must_use]
    pub fn read_abandon_after(&self, poll_interval: Duration) -> Duration {
        self.request_timeout + poll_interval
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            startup_grace: Duration::from_secs(30),
        }
    }
}

/// Exchange counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Requests forwarded to the transport
    pub sent: u64,
    /// Successful answers that settled at least one request
    pub received: u64,
    /// Requests settled by timeout (including suppressed ones)
    pub timeouts: u64,
    /// Answers that matched no pending request
    pub unmatched: u64,
    /// Requests still awaiting an answer
    pub pending: usize,
}

/// Errors surfaced by the bridge and its requesters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// No answer within the request timeout
    #[error("timeout waiting for point {point_id} (request {request_id})")]
    Timeout {
        /// Requested point
        point_id: PointId,
        /// Correlation id
        request_id: String,
    },
    /// The transport answered with an error
    #[error("point {point_id}: {message}")]
    Remote {
        /// Requested point
        point_id: PointId,
        /// Error text from the transport
        message: String,
    },
    /// An answer arrived for a point with nothing pending
    #[error("unmatched response for point {point_id}")]
    UnmatchedResponse {
        /// Point named in the answer
        point_id: PointId,
    },
    /// The transport channel is gone
    #[error("transport channel closed")]
    TransportClosed,
}

impl BridgeError {
    /// Error carried by a failed response, if any.
    #[must_use]
    pub fn from_response(response: &PointResponse) -> Option<Self> {
        match &response.outcome {
            ResponseOutcome::Success { .. } => None,
            ResponseOutcome::Error { message } => Some(Self::Remote {
                point_id: response.point_id,
                message: message.clone(),
            }),
            ResponseOutcome::Timeout => Some(Self::Timeout {
                point_id: response.point_id,
                request_id: response.request_id.clone(),
            }),
        }
    }
}

/// A request accepted from the bus, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Read or write
    pub kind: RequestKind,
    /// Target point
    pub point_id: PointId,
    /// Node that receives the response
    pub source_node_id: String,
    /// Write priority
    pub priority: Option<Value>,
    /// Write value
    pub value: Option<Value>,
}

impl From<&ReadRequest> for OutboundRequest {
    fn from(request: &ReadRequest) -> Self {
        Self {
            kind: RequestKind::Read,
            point_id: request.point_id,
            source_node_id: request.source_node_id.clone(),
            priority: None,
            value: None,
        }
    }
}

impl TryFrom<&WriteRequest> for OutboundRequest {
    type Error = PointError;

    fn try_from(request: &WriteRequest) -> Result<Self, Self::Error> {
        let (Some(point_id), Some(priority), Some(value)) =
            (request.point_id, request.priority.as_ref(), request.value.as_ref())
        else {
            return Err(PointError::InvalidMessage {
                point_id: request.point_id,
            });
        };
        if WritePriority::parse(priority).is_none() {
            return Err(PointError::invalid_priority(point_id, priority));
        }
        Ok(Self {
            kind: RequestKind::Write,
            point_id,
            source_node_id: request.source_node_id.clone(),
            priority: Some(priority.clone()),
            value: Some(value.clone()),
        })
    }
}

/// What the caller must do after accepting a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Correlation id of the new request
    pub request_id: String,
    /// Message for the transport
    pub message: TransportRequest,
    /// When to call [`Bridge::handle_timeout`]
    pub timeout: Duration,
}

/// A settled request, addressed to its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Kind of the settled request
    pub kind: RequestKind,
    /// Response for the source node
    pub response: PointResponse,
}

impl Notification {
    /// Notification for a settled request; `None` while it is still pending.
    fn from_state(state: RequestState) -> Option<Self> {
        let (request, outcome) = state.into_settled()?;
        Some(Self {
            kind: request.kind,
            response: PointResponse {
                point_id: request.point_id,
                request_id: request.request_id,
                target_node_id: request.source_node_id,
                outcome,
                startup_phase: request.startup_phase,
            },
        })
    }

    /// Bus event for the response (`pointReference:response` or
    /// `pointWrite:response`).
    #[must_use]
    pub fn into_event(self) -> BusEvent {
        match self.kind {
            RequestKind::Read => BusEvent::ReadResponse(self.response),
            RequestKind::Write => BusEvent::WriteResponse(self.response),
        }
    }
}

/// Correlates outbound requests with inbound answers.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    started_at: Instant,
    pending: PendingTable,
    stats: BridgeStats,
}

impl Bridge {
    /// Create a bridge whose grace window starts at `started_at`.
    #[must_use]
    pub fn new(config: BridgeConfig, started_at: Instant) -> Self {
        Self {
            config,
            started_at,
            pending: PendingTable::new(),
            stats: BridgeStats::default(),
        }
    }

    /// Timing configuration.
    #[must_use]
    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    /// Whether `now` falls inside the startup grace window.
    #[must_use]
    pub fn in_startup_phase(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) < self.config.startup_grace
    }

    /// A fresh correlation id: point id, epoch milliseconds, random suffix.
    #[must_use]
    pub fn next_request_id(point_id: PointId) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{point_id}-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            &suffix[..8]
        )
    }

    /// Accept a request and produce the transport message and timeout.
    pub fn handle_outbound(&mut self, request: OutboundRequest, now: Instant) -> Dispatch {
        let request_id = Self::next_request_id(request.point_id);
        let startup_phase = self.in_startup_phase(now);

        self.pending.insert(
            request_id.clone(),
            request.point_id,
            request.source_node_id.clone(),
            request.kind,
            startup_phase,
        );
        self.stats.sent += 1;

        let message = match request.kind {
            RequestKind::Read => TransportRequest::read(request.point_id, request_id.clone()),
            RequestKind::Write => TransportRequest::write(
                request.point_id,
                request_id.clone(),
                request.priority.unwrap_or(Value::Null),
                request.value.unwrap_or(Value::Null),
            ),
        };

        tracing::debug!(
            point_id = request.point_id,
            request_id = %request_id,
            source = %request.source_node_id,
            action = %message.action,
            startup_phase,
            "Forwarding request"
        );

        Dispatch {
            request_id,
            message,
            timeout: self.config.request_timeout,
        }
    }

    /// Settle every pending request for the answered point.
    ///
    /// All matches are removed before any notification is returned. An
    /// answer with no match is counted and dropped.
    pub fn handle_inbound(&mut self, response: &TransportResponse) -> Vec<Notification> {
        let outcome = match &response.error {
            Some(message) => ResponseOutcome::Error {
                message: message.clone(),
            },
            None => ResponseOutcome::Success {
                value: response.value.clone(),
            },
        };

        let settled = self.pending.resolve_point(response.point_id, &outcome);
        if settled.is_empty() {
            self.stats.unmatched += 1;
            let error = BridgeError::UnmatchedResponse {
                point_id: response.point_id,
            };
            tracing::warn!(
                %error,
                request_id = ?response.request_id,
                "Ignoring stale or unsolicited response"
            );
            return Vec::new();
        }

        if !response.is_error() {
            self.stats.received += 1;
        }

        tracing::debug!(
            point_id = response.point_id,
            matched = settled.len(),
            error = ?response.error,
            "Settled requests from response"
        );

        settled.into_iter().filter_map(Notification::from_state).collect()
    }

    /// Interpret a raw transport message. Messages without a point id are
    /// not responses and are ignored.
    pub fn handle_message(&mut self, message: &Value) -> Vec<Notification> {
        match TransportResponse::parse(message) {
            Some(response) => self.handle_inbound(&response),
            None => {
                tracing::debug!("Ignoring transport message without pointId");
                Vec::new()
            }
        }
    }

    /// Fire the timeout for `request_id`.
    ///
    /// Returns `None` if the request was already settled, or if it was issued
    /// during the startup grace window and is dropped silently.
    pub fn handle_timeout(&mut self, request_id: &str) -> Option<Notification> {
        let state = self.pending.expire(request_id)?;
        self.stats.timeouts += 1;

        let request = state.request();
        if request.startup_phase {
            tracing::debug!(
                point_id = request.point_id,
                request_id,
                "Dropping request timed out during startup"
            );
            return None;
        }

        tracing::warn!(
            point_id = request.point_id,
            request_id,
            source = %request.source_node_id,
            "Request timed out"
        );
        Notification::from_state(state)
    }

    /// Settle one request with a local failure, such as a closed transport.
    pub fn fail(&mut self, request_id: &str, message: impl Into<String>) -> Option<Notification> {
        let state = self.pending.resolve(
            request_id,
            ResponseOutcome::Error {
                message: message.into(),
            },
        )?;
        Notification::from_state(state)
    }

    /// State of a request that is still pending.
    #[must_use]
    pub fn request_state(&self, request_id: &str) -> Option<RequestState> {
        self.pending.state(request_id)
    }

    /// Exchange counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            pending: self.pending.len(),
            ..self.stats
        }
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read(point_id: PointId, source: &str) -> OutboundRequest {
        OutboundRequest::from(&ReadRequest {
            point_id,
            source_node_id: source.to_string(),
        })
    }

    fn running_bridge() -> (Bridge, Instant) {
        let start = Instant::now();
        let bridge = Bridge::new(BridgeConfig::default(), start);
        (bridge, start + Duration::from_secs(60))
    }

    #[test]
    fn fan_out_settles_all_matches_once() {
        let (mut bridge, now) = running_bridge();
        let first = bridge.handle_outbound(read(42, "a"), now);
        let second = bridge.handle_outbound(read(42, "b"), now);
        bridge.handle_outbound(read(7, "c"), now);
        assert_eq!(bridge.stats().sent, 3);

        let notes = bridge.handle_inbound(&TransportResponse::success(42, None, json!(21.5)));

        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].response.request_id, first.request_id);
        assert_eq!(notes[0].response.target_node_id, "a");
        assert_eq!(notes[1].response.request_id, second.request_id);
        assert_eq!(notes[1].response.target_node_id, "b");
        assert!(notes.iter().all(|n| n.response.is_success()));
        assert_eq!(bridge.stats().received, 1);
        assert_eq!(bridge.pending_len(), 1);

        // the race-losing timeouts find nothing
        assert!(bridge.handle_timeout(&first.request_id).is_none());
        assert!(bridge.handle_timeout(&second.request_id).is_none());
        assert_eq!(bridge.stats().timeouts, 0);
    }

    #[test]
    fn error_response_settles_without_counting() {
        let (mut bridge, now) = running_bridge();
        bridge.handle_outbound(read(5, "a"), now);

        let notes = bridge.handle_inbound(&TransportResponse::failure(5, None, "offline"));

        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[0].response.outcome,
            ResponseOutcome::Error {
                message: "offline".into()
            }
        );
        assert_eq!(bridge.stats().received, 0);
        assert_eq!(bridge.pending_len(), 0);
    }

    #[test]
    fn unmatched_response_is_counted_only() {
        let (mut bridge, _) = running_bridge();
        let notes = bridge.handle_inbound(&TransportResponse::success(99, None, json!(1)));

        assert!(notes.is_empty());
        assert_eq!(bridge.stats().unmatched, 1);
        assert_eq!(bridge.stats().received, 0);
    }

    #[test]
    fn timeout_notifies_once() {
        let (mut bridge, now) = running_bridge();
        let dispatch = bridge.handle_outbound(read(3, "a"), now);
        assert_eq!(dispatch.timeout, Duration::from_secs(10));

        let note = bridge.handle_timeout(&dispatch.request_id).unwrap();
        assert_eq!(note.response.outcome, ResponseOutcome::Timeout);
        assert!(!note.response.startup_phase);
        assert!(bridge.handle_timeout(&dispatch.request_id).is_none());
        assert_eq!(bridge.stats().timeouts, 1);

        // a late answer for the same point is stale
        assert!(bridge
            .handle_inbound(&TransportResponse::success(3, None, json!(1)))
            .is_empty());
    }

    #[test]
    fn startup_phase_timeouts_are_silent() {
        let start = Instant::now();
        let mut bridge = Bridge::new(BridgeConfig::default(), start);
        let dispatch = bridge.handle_outbound(read(3, "a"), start + Duration::from_secs(5));

        assert!(matches!(
            bridge.request_state(&dispatch.request_id),
            Some(RequestState::Pending(ref req)) if req.startup_phase
        ));
        assert!(bridge.handle_timeout(&dispatch.request_id).is_none());
        assert_eq!(bridge.pending_len(), 0);
        assert_eq!(bridge.stats().timeouts, 1);
    }

    #[test]
    fn startup_flag_travels_with_each_request() {
        let start = Instant::now();
        let mut bridge = Bridge::new(BridgeConfig::default(), start);
        bridge.handle_outbound(read(42, "early"), start + Duration::from_secs(1));
        bridge.handle_outbound(read(42, "late"), start + Duration::from_secs(31));

        let notes = bridge.handle_inbound(&TransportResponse::failure(42, None, "no route"));
        let flags: Vec<_> = notes
            .iter()
            .map(|n| (n.response.target_node_id.as_str(), n.response.startup_phase))
            .collect();
        assert_eq!(flags, vec![("early", true), ("late", false)]);
    }

    #[test]
    fn write_dispatch_carries_priority_and_value() {
        let (mut bridge, now) = running_bridge();
        let request = WriteRequest::new(12, "8", json!(72), "flow");
        let outbound = OutboundRequest::try_from(&request).unwrap();

        let dispatch = bridge.handle_outbound(outbound, now);
        assert_eq!(dispatch.message.action, pointbridge_proto::Action::Write);
        assert_eq!(dispatch.message.priority, Some(json!("8")));
        assert_eq!(dispatch.message.value, Some(json!(72)));
        assert!(dispatch.request_id.starts_with("12-"));

        let notes = bridge.handle_message(&json!({"network": {"pointId": 12}, "value": 72}));
        assert!(matches!(notes[0].clone().into_event(), BusEvent::WriteResponse(_)));
    }

    #[test]
    fn invalid_writes_are_rejected_before_dispatch() {
        let mut request = WriteRequest::new(12, "8", json!(72), "flow");
        request.value = None;
        assert_eq!(
            OutboundRequest::try_from(&request),
            Err(PointError::InvalidMessage { point_id: Some(12) })
        );

        let request = WriteRequest::new(12, "17", json!(72), "flow");
        assert_eq!(
            OutboundRequest::try_from(&request),
            Err(PointError::InvalidPriority {
                point_id: 12,
                priority: "17".into()
            })
        );
    }

    #[test]
    fn closed_transport_fails_the_request() {
        let (mut bridge, now) = running_bridge();
        let dispatch = bridge.handle_outbound(read(8, "a"), now);

        let note = bridge.fail(&dispatch.request_id, "transport channel closed").unwrap();
        assert_eq!(
            note.response.outcome,
            ResponseOutcome::Error {
                message: "transport channel closed".into()
            }
        );
        assert!(bridge.fail(&dispatch.request_id, "again").is_none());
        assert!(bridge.handle_timeout(&dispatch.request_id).is_none());
    }

    #[test]
    fn abandoned_reads_outlive_the_timeout() {
        let config = BridgeConfig::default();
        let abandon = config.read_abandon_after(Duration::from_secs(5));
        assert_eq!(abandon, Duration::from_secs(15));
        assert!(abandon > config.request_timeout);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = Bridge::next_request_id(1);
        let b = Bridge::next_request_id(1);
        assert_ne!(a, b);
        assert!(a.starts_with("1-"));
    }

    #[test]
    fn bridge_error_from_response() {
        let response = PointResponse {
            point_id: 4,
            request_id: "4-1-a".into(),
            target_node_id: "n".into(),
            outcome: ResponseOutcome::Timeout,
            startup_phase: false,
        };
        assert_eq!(
            BridgeError::from_response(&response),
            Some(BridgeError::Timeout {
                point_id: 4,
                request_id: "4-1-a".into()
            })
        );
    }
}

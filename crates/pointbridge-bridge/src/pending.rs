//! Correlation table for requests awaiting a transport answer.
//!
//! A request lives in the table only while it is pending. Settling it, by an
//! answer or by its timeout, removes it and hands back the terminal
//! [`RequestState`]. Removal happens exactly once, so whichever of the two
//! arrives second finds nothing to settle.

use chrono::{DateTime, Utc};
use pointbridge_core::{PointId, ResponseOutcome};
use pointbridge_proto::Action;
use std::collections::HashMap;

/// Kind of bridged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `pointReference:read`
    Read,
    /// `pointWrite:write`
    Write,
}

impl From<RequestKind> for Action {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Read => Action::Read,
            RequestKind::Write => Action::Write,
        }
    }
}

/// A request forwarded to the transport and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Correlation id
    pub request_id: String,
    /// Target point
    pub point_id: PointId,
    /// Node that receives the response
    pub source_node_id: String,
    /// Read or write
    pub kind: RequestKind,
    /// Wall-clock issue time
    pub issued_at: DateTime<Utc>,
    /// Issued during the startup grace window
    pub startup_phase: bool,
    /// Insertion order, for deterministic fan-out
    pub(crate) sequence: u64,
}

impl PendingRequest {
    /// Whether this is a write.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == RequestKind::Write
    }
}

/// Lifecycle of a bridged request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestState {
    /// Forwarded, awaiting an answer
    Pending(PendingRequest),
    /// Settled by a transport answer
    Resolved {
        /// The settled request
        request: PendingRequest,
        /// Answer carried back to the source
        outcome: ResponseOutcome,
    },
    /// Settled by its timeout
    TimedOut(PendingRequest),
}

impl RequestState {
    /// The request this state belongs to.
    #[must_use]
    pub fn request(&self) -> &PendingRequest {
        match self {
            Self::Pending(request) | Self::TimedOut(request) => request,
            Self::Resolved { request, .. } => request,
        }
    }

    /// Whether the request has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }

    /// The request and its final outcome, once settled.
    #[must_use]
    pub fn into_settled(self) -> Option<(PendingRequest, ResponseOutcome)> {
        match self {
            Self::Pending(_) => None,
            Self::Resolved { request, outcome } => Some((request, outcome)),
            Self::TimedOut(request) => Some((request, ResponseOutcome::Timeout)),
        }
    }
}

/// Pending requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    next_sequence: u64,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly forwarded request.
    pub fn insert(
        &mut self,
        request_id: String,
        point_id: PointId,
        source_node_id: String,
        kind: RequestKind,
        startup_phase: bool,
    ) -> &PendingRequest {
        self.next_sequence += 1;
        let request = PendingRequest {
            request_id: request_id.clone(),
            point_id,
            source_node_id,
            kind,
            issued_at: Utc::now(),
            startup_phase,
            sequence: self.next_sequence,
        };
        self.entries.entry(request_id).or_insert(request)
    }

    /// Current state of a request, if it is still pending.
    #[must_use]
    pub fn state(&self, request_id: &str) -> Option<RequestState> {
        self.entries.get(request_id).cloned().map(RequestState::Pending)
    }

    /// Settle every pending request for `point_id` with the same outcome.
    ///
    /// All matches leave the table before the returned states are handed
    /// out, in issue order.
    pub fn resolve_point(&mut self, point_id: PointId, outcome: &ResponseOutcome) -> Vec<RequestState> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|req| req.point_id == point_id)
            .map(|req| req.request_id.clone())
            .collect();

        let mut settled: Vec<PendingRequest> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        settled.sort_by_key(|req| req.sequence);

        settled
            .into_iter()
            .map(|request| RequestState::Resolved {
                request,
                outcome: outcome.clone(),
            })
            .collect()
    }

    /// Settle one request by its timeout, if it is still pending.
    pub fn expire(&mut self, request_id: &str) -> Option<RequestState> {
        self.entries.remove(request_id).map(RequestState::TimedOut)
    }

    /// Settle one request with an outcome, if it is still pending.
    pub fn resolve(&mut self, request_id: &str, outcome: ResponseOutcome) -> Option<RequestState> {
        self.entries
            .remove(request_id)
            .map(|request| RequestState::Resolved { request, outcome })
    }

    /// Check whether `request_id` is pending.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_point_takes_every_match_in_order() {
        let mut table = PendingTable::new();
        table.insert("b".into(), 42, "n2".into(), RequestKind::Read, false);
        table.insert("a".into(), 42, "n1".into(), RequestKind::Write, true);
        table.insert("c".into(), 7, "n3".into(), RequestKind::Read, false);

        let settled = table.resolve_point(42, &ResponseOutcome::Success { value: json!(1) });

        let ids: Vec<_> = settled.iter().map(|s| s.request().request_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(settled.iter().all(RequestState::is_settled));
        assert_eq!(table.len(), 1);
        assert!(table.contains("c"));
    }

    #[test]
    fn settlement_happens_once() {
        let mut table = PendingTable::new();
        table.insert("r1".into(), 1, "n".into(), RequestKind::Read, false);

        assert!(matches!(table.state("r1"), Some(RequestState::Pending(_))));
        assert!(table
            .resolve("r1", ResponseOutcome::Error { message: "x".into() })
            .is_some());
        assert!(table.expire("r1").is_none());
        assert!(table.state("r1").is_none());
    }

    #[test]
    fn expire_yields_timed_out() {
        let mut table = PendingTable::new();
        table.insert("r1".into(), 1, "n".into(), RequestKind::Write, false);

        table.insert("r2".into(), 2, "n".into(), RequestKind::Read, false);
        assert!(table.state("r2").unwrap().into_settled().is_none());

        let state = table.expire("r1").unwrap();
        assert!(matches!(state, RequestState::TimedOut(ref req) if req.is_write()));
        let (request, outcome) = state.into_settled().unwrap();
        assert_eq!(request.request_id, "r1");
        assert_eq!(outcome, ResponseOutcome::Timeout);
        assert_eq!(table.len(), 1);
    }
}

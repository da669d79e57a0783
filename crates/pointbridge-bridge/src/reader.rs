//! Polling reader for remote points.
//!
//! A reader keeps the last good value of one point and issues at most one
//! read at a time. Failures keep the stale cache. Failures of requests issued
//! during the startup grace window are swallowed and retried on the next
//! trigger.
//!
//! Every read is addressed to `{node_id}#{generation}`. Once a read has been
//! abandoned, answers to it no longer match and cannot settle its successor.

use crate::bridge::BridgeError;
use chrono::{DateTime, Utc};
use pointbridge_core::events::READ_RESPONSE;
use pointbridge_core::{BusEvent, EventBus, PointId, PointResponse, ReadRequest, ResponseOutcome};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Last value received for a point.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    /// Value as returned by the transport
    pub value: Value,
    /// When it was received
    pub timestamp: DateTime<Utc>,
}

/// What a response meant for the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// A fresh value replaced the cache
    Updated {
        /// Polled point
        point_id: PointId,
        /// New value
        value: Value,
    },
    /// The read failed; the cache is unchanged
    Failed {
        /// Polled point
        point_id: PointId,
        /// Failure reported to downstream consumers
        error: BridgeError,
    },
    /// A startup-phase failure that is not reported
    Suppressed,
    /// The response was addressed to someone else
    Ignored,
}

/// Single-flight poller state for one remote point.
#[derive(Debug)]
pub struct PointReader {
    point_id: PointId,
    node_id: String,
    generation: u64,
    cache: Option<CachedValue>,
    poll_pending: bool,
    pending_since: Option<Instant>,
    stale_after: Duration,
}

impl PointReader {
    /// Create a reader for `point_id` answering to `node_id`.
    ///
    /// A pending read older than `stale_after` no longer blocks new triggers.
    /// The bridge drops startup-phase timeouts without a response, so without
    /// this the reader would wait forever. `stale_after` must exceed the
    /// bridge's request timeout; see [`BridgeConfig::read_abandon_after`].
    ///
    /// [`BridgeConfig::read_abandon_after`]: crate::BridgeConfig::read_abandon_after
    #[must_use]
    pub fn new(point_id: PointId, node_id: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            point_id,
            node_id: node_id.into(),
            generation: 0,
            cache: None,
            poll_pending: false,
            pending_since: None,
            stale_after,
        }
    }

    /// Polled point.
    #[must_use]
    pub fn point_id(&self) -> PointId {
        self.point_id
    }

    /// Node id the response targets are derived from.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Response target of the current read.
    #[must_use]
    pub fn current_target(&self) -> String {
        format!("{}#{}", self.node_id, self.generation)
    }

    /// Last good value.
    #[must_use]
    pub fn cached(&self) -> Option<&CachedValue> {
        self.cache.as_ref()
    }

    /// Whether a read is in flight.
    #[must_use]
    pub fn is_poll_pending(&self) -> bool {
        self.poll_pending
    }

    /// Start a read unless one is already in flight.
    pub fn trigger(&mut self, now: Instant) -> Option<ReadRequest> {
        if self.poll_pending {
            let stale = self
                .pending_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.stale_after);
            if !stale {
                return None;
            }
            tracing::debug!(
                point_id = self.point_id,
                target = %self.current_target(),
                "Abandoning unanswered read"
            );
        }

        self.generation += 1;
        self.poll_pending = true;
        self.pending_since = Some(now);
        Some(ReadRequest {
            point_id: self.point_id,
            source_node_id: self.current_target(),
        })
    }

    /// Apply a read response.
    ///
    /// Only an answer to the current read counts; anything else, including
    /// a late answer to an abandoned read, is ignored.
    pub fn handle_response(&mut self, response: &PointResponse) -> ReaderEvent {
        if response.point_id != self.point_id || !self.poll_pending {
            return ReaderEvent::Ignored;
        }
        if response.target_node_id != self.current_target() {
            if self.is_own_target(&response.target_node_id) {
                tracing::debug!(
                    point_id = self.point_id,
                    request_id = %response.request_id,
                    "Ignoring answer to abandoned read"
                );
            }
            return ReaderEvent::Ignored;
        }

        self.poll_pending = false;
        self.pending_since = None;

        match &response.outcome {
            ResponseOutcome::Success { value } => {
                self.cache = Some(CachedValue {
                    value: value.clone(),
                    timestamp: Utc::now(),
                });
                ReaderEvent::Updated {
                    point_id: self.point_id,
                    value: value.clone(),
                }
            }
            _ if response.startup_phase => {
                tracing::debug!(
                    point_id = self.point_id,
                    request_id = %response.request_id,
                    "Suppressing read failure during startup"
                );
                ReaderEvent::Suppressed
            }
            _ => match BridgeError::from_response(response) {
                Some(error) => {
                    tracing::warn!(point_id = self.point_id, %error, "Read failed");
                    ReaderEvent::Failed {
                        point_id: self.point_id,
                        error,
                    }
                }
                None => ReaderEvent::Ignored,
            },
        }
    }

    fn is_own_target(&self, target: &str) -> bool {
        target
            .strip_prefix(self.node_id.as_str())
            .and_then(|rest| rest.strip_prefix('#'))
            .is_some_and(|generation| generation.parse::<u64>().is_ok())
    }
}

/// Drives a [`PointReader`] on a fixed interval over the bus.
pub struct Poller {
    reader: PointReader,
    bus: EventBus,
    interval: Duration,
}

impl Poller {
    /// Create a poller.
    #[must_use]
    pub fn new(reader: PointReader, bus: EventBus, interval: Duration) -> Self {
        Self {
            reader,
            bus,
            interval,
        }
    }

    /// Poll until `updates` is dropped. Updates and reportable failures are
    /// sent downstream; everything else stays internal.
    pub async fn run(mut self, updates: mpsc::Sender<ReaderEvent>) {
        let mut responses = self.bus.subscribe(READ_RESPONSE);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            point_id = self.reader.point_id(),
            interval = ?self.interval,
            "Polling remote point"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(request) = self.reader.trigger(Instant::now()) {
                        self.bus.emit(BusEvent::ReadRequest(request));
                    }
                }
                event = responses.recv() => {
                    let Some(event) = event else { break };
                    let Some(response) = event.as_response() else { continue };
                    let outcome = self.reader.handle_response(response);
                    if matches!(outcome, ReaderEvent::Updated { .. } | ReaderEvent::Failed { .. })
                        && updates.send(outcome).await.is_err()
                    {
                        break;
                    }
                }
                () = updates.closed() => break,
            }
        }

        self.bus.unsubscribe(&responses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(point_id: PointId, target: &str, outcome: ResponseOutcome, startup: bool) -> PointResponse {
        PointResponse {
            point_id,
            request_id: format!("{point_id}-1-abc"),
            target_node_id: target.to_string(),
            outcome,
            startup_phase: startup,
        }
    }

    fn ok(value: Value) -> ResponseOutcome {
        ResponseOutcome::Success { value }
    }

    #[test]
    fn trigger_is_single_flight() {
        let now = Instant::now();
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));

        let request = reader.trigger(now).unwrap();
        assert_eq!(request.source_node_id, "r#1");
        assert!(reader.trigger(now + Duration::from_secs(1)).is_none());
        assert!(reader.is_poll_pending());

        reader.handle_response(&response(42, "r#1", ok(json!(1)), false));
        assert!(!reader.is_poll_pending());
        let request = reader.trigger(now + Duration::from_secs(2)).unwrap();
        assert_eq!(request.source_node_id, "r#2");
    }

    #[test]
    fn stale_pending_read_is_reissued() {
        let now = Instant::now();
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));

        assert!(reader.trigger(now).is_some());
        assert!(reader.trigger(now + Duration::from_secs(14)).is_none());
        let request = reader.trigger(now + Duration::from_secs(15)).unwrap();
        assert_eq!(request.source_node_id, "r#2");
    }

    #[test]
    fn answers_to_abandoned_reads_are_ignored() {
        let now = Instant::now();
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));
        reader.trigger(now);
        reader.trigger(now + Duration::from_secs(15));

        let late = reader.handle_response(&response(42, "r#1", ResponseOutcome::Timeout, false));
        assert_eq!(late, ReaderEvent::Ignored);
        assert!(reader.is_poll_pending());
        assert!(reader.trigger(now + Duration::from_secs(20)).is_none());

        // a fanned-out success reaches both reads; only the current one counts
        assert_eq!(
            reader.handle_response(&response(42, "r#1", ok(json!(3)), false)),
            ReaderEvent::Ignored
        );
        assert_eq!(
            reader.handle_response(&response(42, "r#2", ok(json!(3)), false)),
            ReaderEvent::Updated {
                point_id: 42,
                value: json!(3)
            }
        );
        assert!(!reader.is_poll_pending());
    }

    #[test]
    fn success_updates_cache() {
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));
        reader.trigger(Instant::now());

        let event = reader.handle_response(&response(42, "r#1", ok(json!(21.5)), false));

        assert_eq!(
            event,
            ReaderEvent::Updated {
                point_id: 42,
                value: json!(21.5)
            }
        );
        assert_eq!(reader.cached().unwrap().value, json!(21.5));
    }

    #[test]
    fn failure_keeps_stale_value() {
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));
        reader.trigger(Instant::now());
        reader.handle_response(&response(42, "r#1", ok(json!(1)), false));
        reader.trigger(Instant::now());

        let event = reader.handle_response(&response(42, "r#2", ResponseOutcome::Timeout, false));

        assert!(matches!(
            event,
            ReaderEvent::Failed { point_id: 42, error: BridgeError::Timeout { .. } }
        ));
        assert_eq!(reader.cached().unwrap().value, json!(1));
        assert!(!reader.is_poll_pending());
    }

    #[test]
    fn startup_failures_are_suppressed() {
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));
        reader.trigger(Instant::now());

        let event = reader.handle_response(&response(
            42,
            "r#1",
            ResponseOutcome::Error {
                message: "no route".into(),
            },
            true,
        ));

        assert_eq!(event, ReaderEvent::Suppressed);
        assert!(!reader.is_poll_pending());
        assert!(reader.cached().is_none());
    }

    #[test]
    fn foreign_responses_are_ignored() {
        let mut reader = PointReader::new(42, "r", Duration::from_secs(15));
        assert_eq!(
            reader.handle_response(&response(42, "r#0", ok(json!(1)), false)),
            ReaderEvent::Ignored
        );
        reader.trigger(Instant::now());

        assert_eq!(reader.handle_response(&response(7, "r#1", ok(json!(1)), false)), ReaderEvent::Ignored);
        assert_eq!(reader.handle_response(&response(42, "other", ok(json!(1)), false)), ReaderEvent::Ignored);
        assert_eq!(reader.handle_response(&response(42, "r", ok(json!(1)), false)), ReaderEvent::Ignored);
        assert!(reader.is_poll_pending());
    }
}

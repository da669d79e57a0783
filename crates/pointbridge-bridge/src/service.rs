//! Async driver for the bridge state machine.
//!
//! One task owns the [`Bridge`]. Bus requests, transport answers and expired
//! timers all arrive as messages on that task, so the pending table is never
//! touched concurrently.

use crate::bridge::{Bridge, BridgeConfig, BridgeError, BridgeStats, OutboundRequest};
use pointbridge_core::events::{READ_REQUEST, WRITE_REQUEST};
use pointbridge_core::{
    BusEvent, EventBus, PointError, PointResponse, ResponseOutcome, Subscription, WriteRequest,
};
use pointbridge_proto::TransportRequest;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Read side of a running service.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    stats: watch::Receiver<BridgeStats>,
}

impl BridgeHandle {
    /// Latest counters published by the service.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        *self.stats.borrow()
    }

    /// Wait until the counters change.
    ///
    /// # Errors
    ///
    /// Returns error once the service has stopped.
    pub async fn changed(&mut self) -> Result<BridgeStats, BridgeError> {
        self.stats
            .changed()
            .await
            .map_err(|_| BridgeError::TransportClosed)?;
        Ok(*self.stats.borrow())
    }
}

/// Bridge task wired to the bus and a transport.
pub struct BridgeService {
    bridge: Bridge,
    bus: EventBus,
    reads: Subscription,
    writes: Subscription,
    outbound: mpsc::Sender<TransportRequest>,
    inbound: mpsc::Receiver<Value>,
    timer_tx: mpsc::UnboundedSender<String>,
    timer_rx: mpsc::UnboundedReceiver<String>,
    stats: watch::Sender<BridgeStats>,
}

impl BridgeService {
    /// Subscribe to bus requests and start the grace window now.
    ///
    /// `outbound` carries requests to the transport; `inbound` carries raw
    /// transport messages back. The service stops when `inbound` closes.
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        bus: EventBus,
        outbound: mpsc::Sender<TransportRequest>,
        inbound: mpsc::Receiver<Value>,
    ) -> (Self, BridgeHandle) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(BridgeStats::default());
        let service = Self {
            bridge: Bridge::new(config, Instant::now()),
            reads: bus.subscribe(READ_REQUEST),
            writes: bus.subscribe(WRITE_REQUEST),
            bus,
            outbound,
            inbound,
            timer_tx,
            timer_rx,
            stats: stats_tx,
        };
        (service, BridgeHandle { stats: stats_rx })
    }

    /// Process events until the transport's inbound channel closes.
    pub async fn run(mut self) {
        tracing::info!(
            request_timeout = ?self.bridge.config().request_timeout,
            startup_grace = ?self.bridge.config().startup_grace,
            "Bridge service started"
        );

        loop {
            tokio::select! {
                Some(event) = self.reads.recv() => {
                    if let BusEvent::ReadRequest(request) = event {
                        self.forward(OutboundRequest::from(&request)).await;
                    }
                }
                Some(event) = self.writes.recv() => {
                    if let BusEvent::WriteRequest(request) = event {
                        match OutboundRequest::try_from(&request) {
                            Ok(outbound) => self.forward(outbound).await,
                            Err(err) => self.reject(&request, &err),
                        }
                    }
                }
                message = self.inbound.recv() => {
                    let Some(message) = message else {
                        tracing::info!("Transport closed, stopping bridge service");
                        break;
                    };
                    for notification in self.bridge.handle_message(&message) {
                        self.bus.emit(notification.into_event());
                    }
                }
                Some(request_id) = self.timer_rx.recv() => {
                    if let Some(notification) = self.bridge.handle_timeout(&request_id) {
                        self.bus.emit(notification.into_event());
                    }
                }
            }
            self.publish_stats();
        }

        self.bus.unsubscribe(&self.reads);
        self.bus.unsubscribe(&self.writes);
        self.publish_stats();
    }

    async fn forward(&mut self, request: OutboundRequest) {
        let dispatch = self.bridge.handle_outbound(request, Instant::now());
        let request_id = dispatch.request_id;

        if self.outbound.send(dispatch.message).await.is_err() {
            let error = BridgeError::TransportClosed;
            tracing::error!(%error, request_id = %request_id, "Failed to forward request");
            if let Some(notification) = self.bridge.fail(&request_id, error.to_string()) {
                self.bus.emit(notification.into_event());
            }
            return;
        }

        let timer = self.timer_tx.clone();
        let timeout = dispatch.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // the service may already be gone
            let _ = timer.send(request_id);
        });
    }

    /// Answer a malformed write without involving the transport.
    fn reject(&self, request: &WriteRequest, error: &PointError) {
        let Some(point_id) = request.point_id else {
            tracing::warn!(%error, source = %request.source_node_id, "Dropping write without pointId");
            return;
        };
        tracing::warn!(point_id, %error, source = %request.source_node_id, "Rejecting write");
        self.bus.emit(BusEvent::WriteResponse(PointResponse {
            point_id,
            request_id: Bridge::next_request_id(point_id),
            target_node_id: request.source_node_id.clone(),
            outcome: ResponseOutcome::Error {
                message: error.to_string(),
            },
            startup_phase: false,
        }));
    }

    fn publish_stats(&self) {
        let stats = self.bridge.stats();
        self.stats.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}

//! Agent runtime orchestration.

use crate::config::{AgentConfig, StoreType};
use crate::gateway::{Gateway, LocalResponder};
use crate::persistence::SqliteStateStore;
use anyhow::{Context, Result};
use pointbridge_bridge::{BridgeService, Poller, PointReader, ReaderEvent};
use pointbridge_core::events::GLOBAL_UPDATE;
use pointbridge_core::{
    BusEvent, EventBus, MemoryStore, PointHost, PointRegistry, PointWriter, SharedStateStore,
};
use pointbridge_proto::{MessageType, TopicScheme, TransportRequest};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    node_id: String,
    store: Arc<dyn SharedStateStore>,
    sqlite: Option<Arc<SqliteStateStore>>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4()));

        let sqlite = match config.persistence.store_type {
            StoreType::Sqlite => Some(Arc::new(
                SqliteStateStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            )),
            StoreType::Memory => None,
        };
        let store: Arc<dyn SharedStateStore> = match sqlite.as_ref() {
            Some(sqlite) => sqlite.clone(),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            config,
            node_id,
            store,
            sqlite,
        })
    }

    /// Owner id of this agent.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        tracing::info!(node_id = %self.node_id, "Starting agent runtime");

        let bus = EventBus::new();
        let registry = Arc::new(PointRegistry::new(self.node_id.clone()));
        let host = PointHost::new(self.node_id.clone(), registry.clone(), self.store.clone());

        // Claim local points
        let mut claimed = Vec::new();
        for declaration in &self.config.points {
            match host.claim(declaration) {
                Ok(registration) => {
                    if let Some(sqlite) = self.sqlite.as_ref() {
                        if let Err(err) = sqlite.save_registration(&registration) {
                            tracing::warn!(
                                error = %err,
                                point_id = registration.point_id,
                                "Failed to record registration"
                            );
                        }
                    }
                    tracing::info!(
                        point_id = registration.point_id,
                        path = ?registration.path,
                        writable = registration.writable,
                        "Claimed point"
                    );
                    claimed.push(registration.point_id);
                }
                Err(err) if err.is_configuration() => {
                    tracing::error!(error = %err, point_id = declaration.point_id, "Point declaration rejected");
                }
                Err(err) => {
                    tracing::warn!(error = %err, point_id = declaration.point_id, "Failed to claim point");
                }
            }
        }

        if let Some(sqlite) = self.sqlite.as_ref() {
            match sqlite.retain_registrations(&claimed) {
                Ok(removed) => {
                    for registration in removed {
                        tracing::info!(
                            point_id = registration.point_id,
                            owner_id = %registration.owner_id,
                            "Dropped leftover registration"
                        );
                    }
                }
                Err(err) => tracing::warn!(error = %err, "Failed to reconcile registrations"),
            }
        }

        let writer = Arc::new(PointWriter::new(
            registry.clone(),
            self.store.clone(),
            bus.clone(),
        ));
        let responder = LocalResponder::new(
            self.node_id.clone(),
            registry.clone(),
            self.store.clone(),
            writer,
        );

        // Initialize gateway
        let topic_scheme = TopicScheme::new(&self.config.gateway.site);
        let (gateway, mut eventloop) = Gateway::new(
            &self.config.gateway.mqtt_broker,
            &format!("pointbridge-{}", self.node_id),
            topic_scheme.clone(),
            self.config.gateway.payload_format,
        )
        .context("Failed to create gateway")?;
        gateway.subscribe().await?;

        // Start the bridge
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<TransportRequest>(100);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Value>(100);
        let (service, bridge) =
            BridgeService::new(self.config.bridge, bus.clone(), outbound_tx, inbound_rx);
        let bridge_task = tokio::spawn(service.run());

        // Start pollers for remote points
        let (updates_tx, mut updates_rx) = mpsc::channel(100);
        for &point_id in &self.config.remote_points {
            let reader = PointReader::new(
                point_id,
                format!("{}/poll/{point_id}", self.node_id),
                self.config.bridge.read_abandon_after(self.config.poll_interval),
            );
            let poller = Poller::new(reader, bus.clone(), self.config.poll_interval);
            tokio::spawn(poller.run(updates_tx.clone()));
        }
        drop(updates_tx);

        let mut state_updates = bus.subscribe(GLOBAL_UPDATE);

        tracing::info!("Agent running, press Ctrl+C to stop");

        // Main event loop
        loop {
            tokio::select! {
                // Handle MQTT events
                event = eventloop.poll() => {
                    match event {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                            tracing::debug!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received gateway message"
                            );
                            match topic_scheme.parse(&publish.topic) {
                                Some(MessageType::Response) => {
                                    let message = match gateway.decode_response(&publish.payload) {
                                        Ok(message) => message,
                                        Err(err) => {
                                            tracing::warn!(error = %err, "Failed to decode response");
                                            continue;
                                        }
                                    };
                                    if !deliver_response(&inbound_tx, message) {
                                        tracing::error!("Bridge service stopped");
                                        break;
                                    }
                                }
                                Some(MessageType::Request) => {
                                    let request = match gateway.decode_request(&publish.payload) {
                                        Ok(request) => request,
                                        Err(err) => {
                                            tracing::warn!(error = %err, "Failed to decode request");
                                            continue;
                                        }
                                    };
                                    if let Some(response) = responder.answer(&request) {
                                        if let Err(err) = gateway.publish_response(&response) {
                                            tracing::warn!(error = %err, point_id = response.point_id, "Failed to publish response");
                                        }
                                    }
                                }
                                None => {}
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }

                // Forward bridge requests
                Some(request) = outbound_rx.recv() => {
                    if let Err(err) = gateway.publish_request(&request) {
                        tracing::warn!(error = %err, request_id = %request.request_id, "Failed to publish request");
                    }
                }

                // Report polled values
                Some(update) = updates_rx.recv() => {
                    match update {
                        ReaderEvent::Updated { point_id, value } => {
                            tracing::info!(point_id, %value, "Remote point updated");
                        }
                        ReaderEvent::Failed { point_id, error } => {
                            tracing::warn!(point_id, %error, "Remote point read failed");
                        }
                        ReaderEvent::Suppressed | ReaderEvent::Ignored => {}
                    }
                }

                // Report local state changes
                Some(event) = state_updates.recv() => {
                    if let BusEvent::GlobalUpdate(update) = event {
                        tracing::info!(
                            store = %update.store,
                            path = %update.path,
                            value = %update.state.value(),
                            active_priority = %update.state.active_priority(),
                            "Priority state changed"
                        );
                    }
                }

                // Handle shutdown
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        for point_id in claimed {
            host.release(point_id);
            if let Some(sqlite) = self.sqlite.as_ref() {
                if let Err(err) = sqlite.remove_registration(point_id) {
                    tracing::warn!(error = %err, point_id, "Failed to remove registration");
                }
            }
        }

        drop(inbound_tx);
        if let Err(err) = bridge_task.await {
            tracing::warn!(error = %err, "Bridge task ended abnormally");
        }

        let stats = bridge.stats();
        tracing::info!(
            sent = stats.sent,
            received = stats.received,
            timeouts = stats.timeouts,
            unmatched = stats.unmatched,
            pending = stats.pending,
            "Agent stopped"
        );
        Ok(())
    }
}

/// Hand an answer to the bridge without waiting for queue space.
///
/// A full queue drops the answer; the request it belonged to times out.
/// Returns `false` once the bridge has stopped.
fn deliver_response(inbound: &mpsc::Sender<Value>, message: Value) -> bool {
    match inbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Bridge inbound queue full, dropping response");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_inbound_queue_drops_instead_of_waiting() {
        let (tx, mut rx) = mpsc::channel(1);

        assert!(deliver_response(&tx, json!({"pointId": 1, "value": 1})));
        assert!(deliver_response(&tx, json!({"pointId": 2, "value": 2})));

        assert_eq!(rx.try_recv().unwrap()["pointId"], json!(1));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!deliver_response(&tx, json!({"pointId": 3})));
    }
}

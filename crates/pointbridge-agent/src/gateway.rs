//! MQTT carrier for the bridge transport.
//!
//! Outbound requests from the bridge are published on the site's `request`
//! topic. Answers arrive on `response` and are handed to the bridge as raw
//! JSON values. Requests for points this agent owns are answered locally, so
//! two agents on the same site can serve each other.
//!
//! Payloads use the configured [`PayloadFormat`]. Publishing only queues the
//! packet for the event loop and fails when the queue is full; it never waits.

use pointbridge_core::{read_point, PointRegistry, PointWriter, SharedStateStore, WriteRequest};
use pointbridge_proto::{
    Action, PayloadFormat, TopicScheme, TransportRequest, TransportResponse,
};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Packets the client queues ahead of the event loop.
const REQUEST_CAPACITY: usize = 100;

/// MQTT publisher for the gateway topics.
pub struct Gateway {
    client: AsyncClient,
    topic_scheme: TopicScheme,
    format: PayloadFormat,
}

impl Gateway {
    /// Create a new gateway client.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
        format: PayloadFormat,
    ) -> Result<(Self, EventLoop), GatewayError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        Ok((
            Self {
                client,
                topic_scheme,
                format,
            },
            eventloop,
        ))
    }

    /// Subscribe to requests and responses of the site.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe(&self) -> Result<(), GatewayError> {
        for topic in [self.topic_scheme.request(), self.topic_scheme.response()] {
            tracing::info!(topic, "Subscribing to gateway topic");

            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| GatewayError::Subscribe(e.to_string()))?;
        }

        Ok(())
    }

    /// Queue an outbound request.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the client queue is full.
    pub fn publish_request(&self, request: &TransportRequest) -> Result<(), GatewayError> {
        let topic = self.topic_scheme.request();
        let payload = self
            .format
            .encode(request)
            .map_err(|e| GatewayError::Serialize(e.to_string()))?;

        tracing::debug!(
            topic,
            point_id = request.point_id,
            request_id = %request.request_id,
            "Publishing request"
        );

        self.publish(topic, payload)
    }

    /// Queue an answer.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the client queue is full.
    pub fn publish_response(&self, response: &TransportResponse) -> Result<(), GatewayError> {
        let topic = self.topic_scheme.response();
        let payload = self
            .format
            .encode(response)
            .map_err(|e| GatewayError::Serialize(e.to_string()))?;

        tracing::debug!(topic, point_id = response.point_id, "Publishing response");

        self.publish(topic, payload)
    }

    /// Decode a payload received on the request topic.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a request in the configured format.
    pub fn decode_request(&self, payload: &[u8]) -> Result<TransportRequest, GatewayError> {
        self.format
            .decode(payload)
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Decode a payload received on the response topic into the raw value
    /// the bridge interprets.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid in the configured format.
    pub fn decode_response(&self, payload: &[u8]) -> Result<Value, GatewayError> {
        self.format
            .decode(payload)
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), GatewayError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| GatewayError::Publish(e.to_string()))
    }
}

/// Answers transport requests for points claimed in the local registry.
pub struct LocalResponder {
    node_id: String,
    registry: Arc<PointRegistry>,
    store: Arc<dyn SharedStateStore>,
    writer: Arc<PointWriter>,
}

impl LocalResponder {
    /// Create a responder over the agent's components.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<PointRegistry>,
        store: Arc<dyn SharedStateStore>,
        writer: Arc<PointWriter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            store,
            writer,
        }
    }

    /// Serve `request` if its point is registered here.
    ///
    /// Returns `None` for points owned elsewhere; some other agent answers
    /// those.
    #[must_use]
    pub fn answer(&self, request: &TransportRequest) -> Option<TransportResponse> {
        let point_id = request.point_id;
        self.registry.lookup(point_id)?;

        let result = match request.action {
            Action::Read => read_point(&self.registry, self.store.as_ref(), point_id)
                .map(|(_, state)| state.value().clone()),
            Action::Write => self
                .writer
                .write(&WriteRequest {
                    point_id: Some(point_id),
                    priority: request.priority.clone(),
                    value: request.value.clone(),
                    source_node_id: self.node_id.clone(),
                })
                .map(|outcome| {
                    tracing::info!(point_id, status = %outcome.status, "Applied remote write");
                    outcome.state.value().clone()
                }),
        };

        let request_id = Some(request.request_id.clone());
        Some(match result {
            Ok(value) => TransportResponse::success(point_id, request_id, value),
            Err(err) => {
                tracing::warn!(point_id, error = %err, action = %request.action, "Local request failed");
                TransportResponse::failure(point_id, request_id, err.to_string())
            }
        })
    }
}

/// Parse MQTT URL into host and port.
pub(crate) fn parse_mqtt_url(input: &str) -> Result<(String, u16), GatewayError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| GatewayError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(GatewayError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GatewayError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            GatewayError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(GatewayError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for gateway operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Serialization failed
    #[error("serialize error: {0}")]
    Serialize(String),
    /// A received payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

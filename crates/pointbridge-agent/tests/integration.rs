//! End-to-end bridging over a live broker.
//!
//! Set `POINTBRIDGE_INTEGRATION=1` (and optionally `POINTBRIDGE_MQTT_BROKER`)
//! to run against a real MQTT broker.

use pointbridge_agent::config::{GatewayConfig, StoreType};
use pointbridge_agent::gateway::Gateway;
use pointbridge_agent::{Agent, AgentConfig};
use pointbridge_bridge::{BridgeConfig, BridgeService};
use pointbridge_core::events::{READ_RESPONSE, WRITE_RESPONSE};
use pointbridge_core::{BusEvent, EventBus, ReadRequest, ResponseOutcome, Subscription, WriteRequest};
use pointbridge_proto::{MessageType, PayloadFormat, TopicScheme, TransportRequest};
use rumqttc::{Event, Packet};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn broker() -> Option<String> {
    if std::env::var("POINTBRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set POINTBRIDGE_INTEGRATION=1 to run");
        return None;
    }
    Some(
        std::env::var("POINTBRIDGE_MQTT_BROKER")
            .unwrap_or_else(|_| "tcp://localhost:1883".to_string()),
    )
}

/// An agent that owns point 1 (`zoneTemp`, default 70) on `site`.
fn owner(broker: &str, site: &str, format: PayloadFormat) -> Agent {
    let mut config = AgentConfig {
        node_id: Some(format!("owner-{}", Uuid::new_v4().simple())),
        gateway: GatewayConfig {
            mqtt_broker: broker.to_string(),
            site: site.to_string(),
            payload_format: format,
        },
        points: serde_json::from_value(json!([
            {"pointId": 1, "path": "zoneTemp", "type": "number", "defaultValue": 70}
        ]))
        .unwrap(),
        ..AgentConfig::default()
    };
    config.persistence.store_type = StoreType::Memory;
    Agent::new(config).unwrap()
}

/// A bridge on its own bus whose transport is a second gateway client.
fn requester(broker: &str, site: &str, format: PayloadFormat) -> EventBus {
    let scheme = TopicScheme::new(site);
    let (gateway, mut eventloop) = Gateway::new(
        broker,
        &format!("requester-{}", Uuid::new_v4().simple()),
        scheme.clone(),
        format,
    )
    .unwrap();

    let bus = EventBus::new();
    let (out_tx, mut out_rx) = mpsc::channel::<TransportRequest>(16);
    let (in_tx, in_rx) = mpsc::channel::<Value>(16);
    let config = BridgeConfig {
        request_timeout: Duration::from_secs(5),
        startup_grace: Duration::ZERO,
    };
    let (service, _handle) = BridgeService::new(config, bus.clone(), out_tx, in_rx);
    tokio::spawn(service.run());

    tokio::spawn(async move {
        gateway.subscribe().await.unwrap();
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish)))
                        if scheme.parse(&publish.topic) == Some(MessageType::Response) =>
                    {
                        if let Ok(message) = gateway.decode_response(&publish.payload) {
                            let _ = in_tx.try_send(message);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                Some(request) = out_rx.recv() => {
                    gateway.publish_request(&request).unwrap();
                }
            }
        }
    });

    bus
}

async fn next_response(responses: &mut Subscription) -> ResponseOutcome {
    // longer than the requester's request timeout
    let event = timeout(Duration::from_secs(10), responses.recv())
        .await
        .expect("timeout waiting for bridged response")
        .expect("bus closed");
    event.as_response().unwrap().outcome.clone()
}

async fn bridged_read_and_write(format: PayloadFormat) {
    let Some(broker) = broker() else { return };
    let site = format!("integration-{}", Uuid::new_v4().simple());

    let agent = tokio::spawn(owner(&broker, &site, format).run());
    let bus = requester(&broker, &site, format);
    let mut reads = bus.subscribe(READ_RESPONSE);
    let mut writes = bus.subscribe(WRITE_RESPONSE);

    // both clients need their subscriptions in place
    tokio::time::sleep(Duration::from_secs(1)).await;

    let read = || {
        BusEvent::ReadRequest(ReadRequest {
            point_id: 1,
            source_node_id: "requester".into(),
        })
    };

    bus.emit(read());
    assert_eq!(
        next_response(&mut reads).await,
        ResponseOutcome::Success { value: json!(70) }
    );

    bus.emit(BusEvent::WriteRequest(WriteRequest::new(1, "8", json!(72), "requester")));
    assert_eq!(
        next_response(&mut writes).await,
        ResponseOutcome::Success { value: json!(72) }
    );

    bus.emit(read());
    assert_eq!(
        next_response(&mut reads).await,
        ResponseOutcome::Success { value: json!(72) }
    );

    // a point nobody owns is never answered
    bus.emit(BusEvent::ReadRequest(ReadRequest {
        point_id: 99,
        source_node_id: "requester".into(),
    }));
    assert_eq!(next_response(&mut reads).await, ResponseOutcome::Timeout);

    agent.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridged_requests_reach_the_owning_agent() {
    bridged_read_and_write(PayloadFormat::Json).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridged_requests_reach_the_owning_agent_over_cbor() {
    bridged_read_and_write(PayloadFormat::Cbor).await;
}

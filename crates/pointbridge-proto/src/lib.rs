//! # PointBridge Protocol
//!
//! Messages crossing the boundary between the bridge and the network gateway.
//!
//! ## Messages
//!
//! - `TransportRequest`: `{action, pointId, requestId, [priority, value], timestamp}`
//! - `TransportResponse`: an answer carrying at least a `pointId`
//!
//! Payloads are JSON by default; [`PayloadFormat::Cbor`] selects CBOR.
//!
//! ## MQTT Topics
//!
//! Topic scheme: `pointbridge/v1/{site}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{Action, MessageError, PayloadFormat, TransportRequest, TransportResponse};
pub use topics::{MessageType, TopicScheme};

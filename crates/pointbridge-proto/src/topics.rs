//! MQTT topic scheme for the gateway carrier.
//!
//! Topic structure: `pointbridge/v1/{site}/{message_type}`
//!
//! Agents publish outbound requests on `request` and answers on `response`.
//! Every agent of a site sees every answer; correlation happens in the bridge.

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Site identifier
    pub site: String,
    /// Topic prefix (default: "pointbridge")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            site: "default".to_string(),
            prefix: "pointbridge".to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a new topic scheme for the given site.
    #[must_use]
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Self::default()
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.site)
    }

    /// Topic for outbound requests.
    #[must_use]
    pub fn request(&self) -> String {
        format!("{}/request", self.base())
    }

    /// Topic for answers.
    #[must_use]
    pub fn response(&self) -> String {
        format!("{}/response", self.base())
    }

    /// Wildcard subscription for all messages of the site.
    #[must_use]
    pub fn site_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Parse a topic into its message type.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<MessageType> {
        let remainder = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        match remainder {
            "request" => Some(MessageType::Request),
            "response" => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Message types in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Outbound read/write request
    Request,
    /// Answer to a request
    Response,
}

//! Agent configuration.

use anyhow::{bail, Context, Result};
use pointbridge_bridge::BridgeConfig;
use pointbridge_core::{PointDeclaration, PointId};
use pointbridge_proto::PayloadFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Owner id used for local claims and as the bus node id
    pub node_id: Option<String>,

    /// Gateway configuration
    pub gateway: GatewayConfig,

    /// Bridge timing
    pub bridge: BridgeConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Interval between polls of remote points
    pub poll_interval: Duration,

    /// Points owned by this agent
    pub points: Vec<PointDeclaration>,

    /// Remote points to poll through the bridge
    pub remote_points: Vec<PointId>,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Site identifier used in topics
    pub site: String,

    /// Encoding of published and received payloads
    pub payload_format: PayloadFormat,
}

/// Which state store backs the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// `SQLite` file
    Sqlite,
    /// Process memory only
    Memory,
}

impl std::str::FromStr for StoreType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store type '{other}', expected 'sqlite' or 'memory'"),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store backend
    pub store_type: StoreType,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            gateway: GatewayConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                site: "default".to_string(),
                payload_format: PayloadFormat::Json,
            },
            bridge: BridgeConfig::default(),
            persistence: PersistenceConfig {
                store_type: StoreType::Sqlite,
                db_path: PathBuf::from("./pointbridge.db"),
            },
            poll_interval: Duration::from_secs(5),
            points: Vec::new(),
            remote_points: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `POINTBRIDGE_NODE_ID`: Owner id of this agent
    /// - `POINTBRIDGE_MQTT_BROKER`: MQTT broker URL
    /// - `POINTBRIDGE_SITE`: Site identifier
    /// - `POINTBRIDGE_PAYLOAD_FORMAT`: "json" or "cbor"
    /// - `POINTBRIDGE_DB_PATH`: `SQLite` database path
    /// - `POINTBRIDGE_STORE_TYPE`: "sqlite" or "memory"
    /// - `POINTBRIDGE_REQUEST_TIMEOUT_MS`: Bridge request timeout
    /// - `POINTBRIDGE_STARTUP_GRACE_MS`: Startup grace window
    /// - `POINTBRIDGE_POLL_INTERVAL_MS`: Remote point poll interval
    /// - `POINTBRIDGE_POINTS`: JSON array of local point declarations
    /// - `POINTBRIDGE_REMOTE_POINTS`: JSON array of remote point ids
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(node_id) = var("POINTBRIDGE_NODE_ID") {
            config.node_id = Some(node_id);
        }

        if let Some(mqtt) = var("POINTBRIDGE_MQTT_BROKER") {
            config.gateway.mqtt_broker = mqtt;
        }

        if let Some(site) = var("POINTBRIDGE_SITE") {
            config.gateway.site = site;
        }

        if let Some(format) = var("POINTBRIDGE_PAYLOAD_FORMAT") {
            config.gateway.payload_format = format
                .parse()
                .context("Invalid POINTBRIDGE_PAYLOAD_FORMAT")?;
        }

        if let Some(db_path) = var("POINTBRIDGE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(store_type) = var("POINTBRIDGE_STORE_TYPE") {
            config.persistence.store_type = store_type
                .parse()
                .context("Invalid POINTBRIDGE_STORE_TYPE")?;
        }

        if let Some(ms) = var("POINTBRIDGE_REQUEST_TIMEOUT_MS") {
            config.bridge.request_timeout = parse_millis(&ms, "POINTBRIDGE_REQUEST_TIMEOUT_MS")?;
        }

        if let Some(ms) = var("POINTBRIDGE_STARTUP_GRACE_MS") {
            config.bridge.startup_grace = parse_millis(&ms, "POINTBRIDGE_STARTUP_GRACE_MS")?;
        }

        if let Some(ms) = var("POINTBRIDGE_POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis(&ms, "POINTBRIDGE_POLL_INTERVAL_MS")?;
        }

        if let Some(points_json) = var("POINTBRIDGE_POINTS") {
            config.points =
                serde_json::from_str(&points_json).context("Invalid POINTBRIDGE_POINTS JSON")?;
        }

        if let Some(remote_json) = var("POINTBRIDGE_REMOTE_POINTS") {
            config.remote_points = serde_json::from_str(&remote_json)
                .context("Invalid POINTBRIDGE_REMOTE_POINTS JSON")?;
        }

        Ok(config)
    }
}

fn parse_millis(value: &str, name: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {name}: '{value}'"))?;
    Ok(Duration::from_millis(ms))
}

//! # PointBridge Agent
//!
//! Gateway agent for priority-arbitrated building-automation points.
//!
//! ## Architecture
//!
//! The agent runs four cooperating loops:
//! 1. **Ownership**: Claims the configured local points and initializes their state
//! 2. **Bridge**: Correlates bus read/write requests with gateway answers
//! 3. **Gateway**: Carries requests and answers over MQTT, serving local points
//! 4. **Polling**: Reads configured remote points on a fixed interval
//!
//! The main loop never waits on the bridge task. Answers are handed over
//! with `try_send` and publishes are queued without blocking, so a burst on
//! one side cannot stall the other.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod gateway;
pub mod persistence;
pub mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

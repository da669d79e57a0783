//! # PointBridge Bridge
//!
//! Correlates bus requests with a request/response transport.
//!
//! ## Components
//!
//! - [`PendingTable`]: pending requests keyed by correlation id
//! - [`Bridge`]: the synchronous settlement state machine
//! - [`BridgeService`]: one async task driving the bridge from the bus
//! - [`PointReader`] and [`Poller`]: single-flight polling of remote points
//!
//! ## Settlement
//!
//! An answer settles every pending request for its point at once. Each
//! request is settled exactly once, either by an answer or by its timeout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod pending;
pub mod reader;
pub mod service;

pub use bridge::{
    Bridge, BridgeConfig, BridgeError, BridgeStats, Dispatch, Notification, OutboundRequest,
};
pub use pending::{PendingRequest, PendingTable, RequestKind, RequestState};
pub use reader::{CachedValue, Poller, PointReader, ReaderEvent};
pub use service::{BridgeHandle, BridgeService};

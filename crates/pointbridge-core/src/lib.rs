//! # PointBridge Core
//!
//! Point ownership and priority arbitration for building-automation flows.
//!
//! This crate provides:
//! - A point registry enforcing one owner per point id
//! - BACnet-style 16-level priority state with deterministic winner resolution
//! - The shared state store abstraction and an in-memory implementation
//! - An in-process event bus and the payloads it carries
//! - The local write and read paths over registry and store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod events;
pub mod host;
pub mod priority;
pub mod registry;
pub mod store;
pub mod writer;

pub use bus::{EventBus, Subscription};
pub use error::{PointError, StoreError};
pub use events::{BusEvent, PointResponse, ReadRequest, ResponseOutcome, StateUpdate, WriteRequest};
pub use host::{read_point, PointDeclaration, PointHost};
pub use priority::{ActivePriority, PriorityBlock, PriorityLevel, PriorityState, WritePriority};
pub use registry::{ClaimCheck, ClaimStatus, PointId, PointRegistration, PointRegistry, RegistrationMeta};
pub use store::{MemoryStore, SharedStateStore};
pub use writer::{PointWriter, WriteOutcome};

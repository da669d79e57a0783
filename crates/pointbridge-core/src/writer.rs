//! Local arbitration write path.
//!
//! A write resolves the point through the registry, loads its priority state,
//! applies the slot update, re-arbitrates, persists, and only then broadcasts
//! `global-update`. A failed store write produces an error and no broadcast.

use crate::bus::EventBus;
use crate::error::PointError;
use crate::events::{BusEvent, StateUpdate, WriteRequest};
use crate::priority::{json_type_name, PriorityState, WritePriority};
use crate::registry::{PointId, PointRegistry};
use crate::store::SharedStateStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    /// Commanded point
    pub point_id: PointId,
    /// Store namespace
    pub store: String,
    /// Key inside the store
    pub path: String,
    /// State after arbitration
    pub state: PriorityState,
    /// Requested vs. resulting priority and value
    pub status: String,
}

/// Applies write requests against the registry and state store.
pub struct PointWriter {
    registry: Arc<PointRegistry>,
    store: Arc<dyn SharedStateStore>,
    bus: EventBus,
    /// Serializes load-modify-store cycles issued through this writer
    write_lock: Mutex<()>,
}

impl PointWriter {
    /// Create a writer over shared components.
    #[must_use]
    pub fn new(registry: Arc<PointRegistry>, store: Arc<dyn SharedStateStore>, bus: EventBus) -> Self {
        Self {
            registry,
            store,
            bus,
            write_lock: Mutex::new(()),
        }
    }

    /// Validate and apply a write request.
    ///
    /// # Errors
    ///
    /// Returns the first failed check, in order: missing properties, unknown
    /// id, not writable, missing state, type mismatch, invalid priority, store
    /// failure. State is not modified on error.
    pub fn write(&self, request: &WriteRequest) -> Result<WriteOutcome, PointError> {
        let (Some(point_id), Some(raw_priority), Some(value)) =
            (request.point_id, request.priority.as_ref(), request.value.as_ref())
        else {
            return Err(PointError::InvalidMessage {
                point_id: request.point_id,
            });
        };

        let registration = self
            .registry
            .lookup(point_id)
            .ok_or(PointError::UnknownId { point_id })?;
        let path = registration
            .path
            .clone()
            .ok_or(PointError::UnknownId { point_id })?;

        if !registration.writable {
            return Err(PointError::NotWritable { point_id });
        }

        let _guard = self.write_lock.lock();

        let mut state = self
            .store
            .get(&registration.store, &path)
            .map_err(|e| PointError::Store {
                point_id,
                message: e.to_string(),
            })?
            .ok_or(PointError::PointNotFound { point_id })?;

        if let Some(expected) = state.metadata().value_type.as_deref() {
            let actual = json_type_name(value);
            if !value.is_null() && actual != expected {
                return Err(PointError::TypeMismatch {
                    point_id,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let priority = WritePriority::parse(raw_priority)
            .ok_or_else(|| PointError::invalid_priority(point_id, raw_priority))?;

        state.apply(priority, value.clone(), Utc::now());

        self.store
            .set(&registration.store, &path, &state)
            .map_err(|e| PointError::Store {
                point_id,
                message: e.to_string(),
            })?;

        let status = format!(
            "P{priority}:{value} > P{}:{}",
            state.active_priority(),
            state.value()
        );
        tracing::debug!(
            point_id,
            store = %registration.store,
            path = %path,
            %status,
            "Applied write"
        );

        self.bus.emit(BusEvent::GlobalUpdate(StateUpdate {
            store: registration.store.clone(),
            path: path.clone(),
            state: state.clone(),
        }));

        Ok(WriteOutcome {
            point_id,
            store: registration.store,
            path,
            state,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::GLOBAL_UPDATE;
    use crate::registry::RegistrationMeta;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    struct Fixture {
        registry: Arc<PointRegistry>,
        store: Arc<MemoryStore>,
        bus: EventBus,
        writer: PointWriter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PointRegistry::new("site"));
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let writer = PointWriter::new(registry.clone(), store.clone(), bus.clone());
        Fixture {
            registry,
            store,
            bus,
            writer,
        }
    }

    fn install(fx: &Fixture, point_id: PointId, meta: RegistrationMeta, state: &PriorityState) {
        let path = meta.path.clone().unwrap();
        let store_name = meta.store.clone();
        assert!(fx.registry.register(point_id, meta));
        fx.store.set(&store_name, &path, state).unwrap();
    }

    #[test]
    fn zone_temp_scenario() {
        let fx = fixture();
        install(
            &fx,
            1,
            RegistrationMeta::writable("ctrlA", "global", "zoneTemp"),
            &PriorityState::new(Value::Null, None),
        );

        let out = fx.writer.write(&WriteRequest::new(1, "8", json!(72), "n")).unwrap();
        assert_eq!(out.state.value(), &json!(72));
        assert_eq!(out.state.active_priority().to_string(), "8");

        let out = fx.writer.write(&WriteRequest::new(1, "2", json!(68), "n")).unwrap();
        assert_eq!(out.state.value(), &json!(68));
        assert_eq!(out.state.active_priority().to_string(), "2");
        assert_eq!(out.status, "P2:68 > P2:68");

        let out = fx.writer.write(&WriteRequest::new(1, "2", Value::Null, "n")).unwrap();
        assert_eq!(out.state.value(), &json!(72));
        assert_eq!(out.state.active_priority().to_string(), "8");

        let stored = fx.store.get("global", "zoneTemp").unwrap().unwrap();
        assert_eq!(stored, out.state);
        assert!(stored.metadata().last_set.is_some());
    }

    #[test]
    fn missing_properties_are_rejected() {
        let fx = fixture();
        let mut request = WriteRequest::new(1, "8", json!(1), "n");
        request.value = None;

        assert_eq!(
            fx.writer.write(&request),
            Err(PointError::InvalidMessage { point_id: Some(1) })
        );
    }

    #[test]
    fn unknown_and_pathless_points() {
        let fx = fixture();
        assert_eq!(
            fx.writer.write(&WriteRequest::new(5, "8", json!(1), "n")),
            Err(PointError::UnknownId { point_id: 5 })
        );

        let mut meta = RegistrationMeta::writable("a", "global", "p");
        meta.path = None;
        fx.registry.register(5, meta);
        assert_eq!(
            fx.writer.write(&WriteRequest::new(5, "8", json!(1), "n")),
            Err(PointError::UnknownId { point_id: 5 })
        );
    }

    #[test]
    fn read_only_point_is_not_mutated() {
        let fx = fixture();
        let initial = PriorityState::new(json!(1), None);
        install(
            &fx,
            2,
            RegistrationMeta::writable("a", "global", "fan").read_only(),
            &initial,
        );

        assert_eq!(
            fx.writer.write(&WriteRequest::new(2, "8", json!(3), "n")),
            Err(PointError::NotWritable { point_id: 2 })
        );
        assert_eq!(fx.store.get("global", "fan").unwrap(), Some(initial));
    }

    #[test]
    fn type_mismatch_is_not_mutated() {
        let fx = fixture();
        let initial = PriorityState::new(json!(70), Some("number".into()));
        install(&fx, 3, RegistrationMeta::writable("a", "global", "sp"), &initial);

        let err = fx
            .writer
            .write(&WriteRequest::new(3, "8", json!("warm"), "n"))
            .unwrap_err();
        assert!(matches!(err, PointError::TypeMismatch { ref actual, .. } if actual == "string"));
        assert_eq!(fx.store.get("global", "sp").unwrap(), Some(initial));

        // relinquish is exempt from the type check
        assert!(fx.writer.write(&WriteRequest::new(3, "8", Value::Null, "n")).is_ok());
    }

    #[test]
    fn missing_state_and_bad_priority() {
        let fx = fixture();
        fx.registry
            .register(4, RegistrationMeta::writable("a", "global", "nowhere"));
        assert_eq!(
            fx.writer.write(&WriteRequest::new(4, "8", json!(1), "n")),
            Err(PointError::PointNotFound { point_id: 4 })
        );

        fx.store
            .set("global", "nowhere", &PriorityState::new(json!(0), None))
            .unwrap();
        assert_eq!(
            fx.writer.write(&WriteRequest::new(4, "17", json!(1), "n")),
            Err(PointError::InvalidPriority {
                point_id: 4,
                priority: "17".into()
            })
        );
    }

    #[test]
    fn relinquish_slot_seven() {
        let fx = fixture();
        install(
            &fx,
            6,
            RegistrationMeta::writable("a", "global", "damper"),
            &PriorityState::new(json!(10), None),
        );
        fx.writer.write(&WriteRequest::new(6, 7, json!(55), "n")).unwrap();

        let out = fx.writer.write(&WriteRequest::new(6, "7", Value::Null, "n")).unwrap();
        assert_eq!(out.state.value(), &json!(10));
        assert_eq!(out.state.active_priority().to_string(), "default");
        assert!(out.state.priority().is_empty());
    }

    #[test]
    fn default_null_keeps_default() {
        let fx = fixture();
        install(
            &fx,
            8,
            RegistrationMeta::writable("a", "global", "mode"),
            &PriorityState::new(json!("auto"), None),
        );

        let out = fx
            .writer
            .write(&WriteRequest::new(8, "default", Value::Null, "n"))
            .unwrap();
        assert_eq!(out.state.default_value(), &json!("auto"));
    }

    #[test]
    fn broadcast_follows_successful_store() {
        let fx = fixture();
        let mut updates = fx.bus.subscribe(GLOBAL_UPDATE);
        install(
            &fx,
            1,
            RegistrationMeta::writable("a", "global", "zoneTemp"),
            &PriorityState::new(Value::Null, None),
        );

        fx.writer.write(&WriteRequest::new(1, "8", json!(72), "n")).unwrap();

        let Some(BusEvent::GlobalUpdate(update)) = updates.try_recv() else {
            panic!("expected global update");
        };
        assert_eq!(update.path, "zoneTemp");
        assert_eq!(update.state.value(), &json!(72));
        // the broadcast state is what the store holds
        assert_eq!(
            fx.store.get("global", "zoneTemp").unwrap(),
            Some(update.state)
        );
    }

    struct FailingStore(MemoryStore);

    impl SharedStateStore for FailingStore {
        fn get(&self, namespace: &str, key: &str) -> Result<Option<PriorityState>, StoreError> {
            self.0.get(namespace, key)
        }

        fn set(&self, _: &str, _: &str, _: &PriorityState) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
    }

    #[test]
    fn failed_store_write_suppresses_broadcast() {
        let registry = Arc::new(PointRegistry::new("site"));
        let inner = MemoryStore::new();
        inner
            .set("global", "zoneTemp", &PriorityState::new(Value::Null, None))
            .unwrap();
        let bus = EventBus::new();
        let mut updates = bus.subscribe(GLOBAL_UPDATE);
        registry.register(1, RegistrationMeta::writable("a", "global", "zoneTemp"));
        let writer = PointWriter::new(registry, Arc::new(FailingStore(inner)), bus);

        let err = writer.write(&WriteRequest::new(1, "8", json!(72), "n")).unwrap_err();
        assert!(matches!(err, PointError::Store { point_id: 1, .. }));
        assert!(updates.try_recv().is_none());
    }
}

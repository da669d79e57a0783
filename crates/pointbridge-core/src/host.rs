//! Point ownership: claiming, initializing, releasing, and local reads.

use crate::error::PointError;
use crate::priority::PriorityState;
use crate::registry::{PointId, PointRegistration, PointRegistry, RegistrationMeta};
use crate::store::SharedStateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

fn default_store() -> String {
    "global".to_string()
}

fn default_writable() -> bool {
    true
}

/// A point an owner declares at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointDeclaration {
    /// Point id to claim
    pub point_id: PointId,
    /// Key of the priority state
    pub path: String,
    /// Store namespace
    #[serde(default = "default_store")]
    pub store: String,
    /// Whether writers may command the point
    #[serde(default = "default_writable")]
    pub writable: bool,
    /// Declared JSON type of the value
    #[serde(rename = "type", default)]
    pub value_type: Option<String>,
    /// Initial relinquish default
    #[serde(default)]
    pub default_value: Value,
    /// Owner override; hosts use their own id when absent
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Owns a set of points on behalf of one component.
pub struct PointHost {
    owner_id: String,
    registry: Arc<PointRegistry>,
    store: Arc<dyn SharedStateStore>,
}

impl PointHost {
    /// Create a host claiming points as `owner_id`.
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        registry: Arc<PointRegistry>,
        store: Arc<dyn SharedStateStore>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            registry,
            store,
        }
    }

    /// Owner id used for claims.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Claim a point and create its priority state if the store has none.
    ///
    /// Existing state is kept, so a restarted owner resumes with the
    /// commands that were active before.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationConflict` if another owner holds the id, or a
    /// store error if the initial state cannot be written.
    pub fn claim(&self, declaration: &PointDeclaration) -> Result<PointRegistration, PointError> {
        let point_id = declaration.point_id;
        let owner_id = declaration
            .owner_id
            .clone()
            .unwrap_or_else(|| self.owner_id.clone());
        let meta = RegistrationMeta {
            owner_id,
            writable: declaration.writable,
            path: Some(declaration.path.clone()),
            store: declaration.store.clone(),
        };

        if !self.registry.register(point_id, meta) {
            let owner_id = self
                .registry
                .lookup(point_id)
                .map(|reg| reg.owner_id)
                .unwrap_or_default();
            return Err(PointError::RegistrationConflict { point_id, owner_id });
        }

        let store_err = |e: crate::error::StoreError| PointError::Store {
            point_id,
            message: e.to_string(),
        };
        if self
            .store
            .get(&declaration.store, &declaration.path)
            .map_err(store_err)?
            .is_none()
        {
            let state = PriorityState::new(
                declaration.default_value.clone(),
                declaration.value_type.clone(),
            );
            self.store
                .set(&declaration.store, &declaration.path, &state)
                .map_err(store_err)?;
            tracing::info!(
                point_id,
                store = %declaration.store,
                path = %declaration.path,
                "Initialized priority state"
            );
        }

        self.registry
            .lookup(point_id)
            .ok_or(PointError::PointNotRegistered { point_id })
    }

    /// Release a point claimed by this host. Stored state is kept.
    pub fn release(&self, point_id: PointId) -> bool {
        self.registry.unregister(point_id, &self.owner_id)
    }
}

/// Read the current priority state of a registered point.
///
/// # Errors
///
/// Returns `PointNotRegistered` if the id has no registration or path, and
/// `PointNotFound` if the store holds no state for it.
pub fn read_point(
    registry: &PointRegistry,
    store: &dyn SharedStateStore,
    point_id: PointId,
) -> Result<(PointRegistration, PriorityState), PointError> {
    let registration = registry
        .lookup(point_id)
        .ok_or(PointError::PointNotRegistered { point_id })?;
    let path = registration
        .path
        .as_deref()
        .ok_or(PointError::PointNotRegistered { point_id })?;

    let state = store
        .get(&registration.store, path)
        .map_err(|e| PointError::Store {
            point_id,
            message: e.to_string(),
        })?
        .ok_or(PointError::PointNotFound { point_id })?;

    Ok((registration, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::ActivePriority;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn declaration(point_id: PointId, path: &str) -> PointDeclaration {
        serde_json::from_value(json!({
            "pointId": point_id,
            "path": path,
            "type": "number",
            "defaultValue": 70
        }))
        .unwrap()
    }

    #[test]
    fn claim_initializes_state_once() {
        let registry = Arc::new(PointRegistry::new("site"));
        let store = Arc::new(MemoryStore::new());
        let host = PointHost::new("ctrlA", registry.clone(), store.clone());

        let reg = host.claim(&declaration(1, "zoneTemp")).unwrap();
        assert_eq!(reg.owner_id, "ctrlA");
        assert_eq!(reg.store, "global");
        assert!(reg.writable);

        let (_, state) = read_point(&registry, store.as_ref(), 1).unwrap();
        assert_eq!(state.value(), &json!(70));
        assert_eq!(state.active_priority(), ActivePriority::Default);

        // a restart keeps whatever state is already stored
        let mut changed = state.clone();
        changed.apply(
            crate::priority::WritePriority::Default,
            json!(65),
            chrono::Utc::now(),
        );
        store.set("global", "zoneTemp", &changed).unwrap();
        host.claim(&declaration(1, "zoneTemp")).unwrap();
        let (_, state) = read_point(&registry, store.as_ref(), 1).unwrap();
        assert_eq!(state.value(), &json!(65));
    }

    #[test]
    fn conflicting_claim_reports_owner() {
        let registry = Arc::new(PointRegistry::new("site"));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let a = PointHost::new("ctrlA", registry.clone(), store.clone());
        let b = PointHost::new("ctrlB", registry.clone(), store);

        a.claim(&declaration(1, "zoneTemp")).unwrap();
        let err = b.claim(&declaration(1, "other")).unwrap_err();

        assert_eq!(
            err,
            PointError::RegistrationConflict {
                point_id: 1,
                owner_id: "ctrlA".into()
            }
        );
        assert!(!b.release(1));
        assert!(a.release(1));
    }

    #[test]
    fn read_point_errors() {
        let registry = PointRegistry::new("site");
        let store = MemoryStore::new();

        assert_eq!(
            read_point(&registry, &store, 9).unwrap_err(),
            PointError::PointNotRegistered { point_id: 9 }
        );

        registry.register(9, RegistrationMeta::writable("a", "global", "missing"));
        assert_eq!(
            read_point(&registry, &store, 9).unwrap_err(),
            PointError::PointNotFound { point_id: 9 }
        );
    }
}

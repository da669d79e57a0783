//! Point registry with single-owner claims.
//!
//! Each numeric point id maps to at most one [`PointRegistration`]. A second
//! owner trying to claim the same id is rejected and the existing record is
//! left untouched; the same owner re-registering merges the new metadata.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric point identifier.
pub type PointId = u32;

/// Ownership metadata for a claimed point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointRegistration {
    /// Claimed point id
    pub point_id: PointId,
    /// Owning component
    pub owner_id: String,
    /// Whether writers may command the point
    pub writable: bool,
    /// Key of the priority state inside `store`
    pub path: Option<String>,
    /// Namespace of the priority state
    pub store: String,
}

/// Claim metadata supplied by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationMeta {
    /// Owning component
    pub owner_id: String,
    /// Whether writers may command the point
    pub writable: bool,
    /// Key of the priority state inside `store`
    pub path: Option<String>,
    /// Namespace of the priority state
    pub store: String,
}

impl RegistrationMeta {
    /// Metadata for a writable point stored under `store`/`path`.
    #[must_use]
    pub fn writable(
        owner_id: impl Into<String>,
        store: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            writable: true,
            path: Some(path.into()),
            store: store.into(),
        }
    }

    /// Same metadata with writes disabled.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

/// Result of an administrative claim check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// No registration exists for the id
    Available,
    /// The id is registered to the querying owner (or no owner was given)
    Assigned,
    /// The id is registered to a different owner
    Collision,
}

/// Claim status plus the registration that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCheck {
    /// Claim status
    pub status: ClaimStatus,
    /// Existing registration, if any
    pub details: Option<PointRegistration>,
}

/// An isolated registry instance.
///
/// Interior locking lets the registry be shared behind an `Arc` between the
/// writer, reader, and gateway tasks of one process.
#[derive(Debug, Default)]
pub struct PointRegistry {
    name: String,
    points: RwLock<BTreeMap<PointId, PointRegistration>>,
}

impl PointRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim `point_id` for `meta.owner_id`.
    ///
    /// Returns `false` when another owner already holds the id.
    pub fn register(&self, point_id: PointId, meta: RegistrationMeta) -> bool {
        let mut points = self.points.write();

        if let Some(existing) = points.get_mut(&point_id) {
            if existing.owner_id != meta.owner_id {
                tracing::warn!(
                    registry = %self.name,
                    point_id,
                    owner = %existing.owner_id,
                    claimant = %meta.owner_id,
                    "Point id already claimed"
                );
                return false;
            }
            existing.writable = meta.writable;
            existing.path = meta.path;
            existing.store = meta.store;
            tracing::debug!(registry = %self.name, point_id, "Updated registration");
            return true;
        }

        tracing::debug!(
            registry = %self.name,
            point_id,
            owner = %meta.owner_id,
            "Registered point"
        );
        points.insert(
            point_id,
            PointRegistration {
                point_id,
                owner_id: meta.owner_id,
                writable: meta.writable,
                path: meta.path,
                store: meta.store,
            },
        );
        true
    }

    /// Release `point_id` if `owner_id` holds it.
    ///
    /// Returns `true` if a registration was removed.
    pub fn unregister(&self, point_id: PointId, owner_id: &str) -> bool {
        let mut points = self.points.write();
        match points.get(&point_id) {
            Some(existing) if existing.owner_id == owner_id => {
                points.remove(&point_id);
                tracing::debug!(registry = %self.name, point_id, owner = owner_id, "Unregistered point");
                true
            }
            Some(existing) => {
                tracing::debug!(
                    registry = %self.name,
                    point_id,
                    owner = %existing.owner_id,
                    caller = owner_id,
                    "Ignoring unregister from non-owner"
                );
                false
            }
            None => false,
        }
    }

    /// Get the registration for `point_id`.
    #[must_use]
    pub fn lookup(&self, point_id: PointId) -> Option<PointRegistration> {
        self.points.read().get(&point_id).cloned()
    }

    /// Check whether `point_id` could be claimed by `owner_id`.
    #[must_use]
    pub fn check(&self, point_id: PointId, owner_id: Option<&str>) -> ClaimCheck {
        let details = self.lookup(point_id);
        let status = match (&details, owner_id) {
            (None, _) => ClaimStatus::Available,
            (Some(reg), Some(owner)) if reg.owner_id != owner => ClaimStatus::Collision,
            (Some(_), _) => ClaimStatus::Assigned,
        };
        ClaimCheck { status, details }
    }

    /// All registrations ordered by point id.
    #[must_use]
    pub fn list(&self) -> Vec<PointRegistration> {
        self.points.read().values().cloned().collect()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

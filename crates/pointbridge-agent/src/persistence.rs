//! `SQLite` persistence layer.

use parking_lot::Mutex;
use pointbridge_core::{PointId, PointRegistration, PriorityState, SharedStateStore, StoreError};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;

/// `SQLite`-backed priority state store.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqliteResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a claimed point so administrative tools can list it.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn save_registration(&self, registration: &PointRegistration) -> SqliteResult<()> {
        self.conn.lock().execute(
            r"
            INSERT OR REPLACE INTO registrations (point_id, owner_id, writable, store, path, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            (
                registration.point_id,
                &registration.owner_id,
                registration.writable,
                &registration.store,
                &registration.path,
                now_millis(),
            ),
        )?;

        Ok(())
    }

    /// List recorded registrations ordered by point id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn registrations(&self) -> SqliteResult<Vec<PointRegistration>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT point_id, owner_id, writable, store, path FROM registrations
            ORDER BY point_id ASC
            ",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(PointRegistration {
                    point_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    writable: row.get(2)?,
                    store: row.get(3)?,
                    path: row.get(4)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Forget a released point.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn remove_registration(&self, point_id: PointId) -> SqliteResult<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM registrations WHERE point_id = ?1", [point_id])?;
        Ok(deleted > 0)
    }

    /// Drop recorded registrations that are not in `claimed`, such as those
    /// left behind by a run that did not shut down cleanly. Returns the
    /// removed records.
    ///
    /// # Errors
    ///
    /// Returns error if query or delete fails.
    pub fn retain_registrations(&self, claimed: &[PointId]) -> SqliteResult<Vec<PointRegistration>> {
        let mut removed = Vec::new();
        for registration in self.registrations()? {
            if !claimed.contains(&registration.point_id) {
                self.remove_registration(registration.point_id)?;
                removed.push(registration);
            }
        }
        Ok(removed)
    }
}

impl SharedStateStore for SqliteStateStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<PriorityState>, StoreError> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM priority_state WHERE namespace = ?1 AND key = ?2",
                (namespace, key),
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(json.and_then(|json| match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(error = %err, namespace, key, "Discarding unreadable priority state");
                None
            }
        }))
    }

    fn set(&self, namespace: &str, key: &str, state: &PriorityState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state).map_err(|e| StoreError::Encode(e.to_string()))?;

        self.conn
            .lock()
            .execute(
                r"
                INSERT OR REPLACE INTO priority_state (namespace, key, state_json, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                (namespace, key, json, now_millis()),
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r"
        -- Priority state per (store, path)
        CREATE TABLE IF NOT EXISTS priority_state (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            state_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        -- Points claimed by this agent
        CREATE TABLE IF NOT EXISTS registrations (
            point_id INTEGER PRIMARY KEY,
            owner_id TEXT NOT NULL,
            writable INTEGER NOT NULL,
            store TEXT NOT NULL,
            path TEXT,
            updated_at INTEGER NOT NULL
        );
        ",
    )
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

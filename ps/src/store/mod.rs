//! PlanStore - repository over the registry and per-plan databases
//!
//! The handle is cheap to clone. The registry connection and each plan
//! connection sit behind their own locks, so operations on different plans
//! never wait on each other.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::model::{PlanSummary, PlanTree};
use crate::now_ms;
use crate::schema;

mod deps;
mod tasks;
mod tree;

pub use deps::DroppedEdges;
pub use tree::{SnapshotRecord, UpsertReport};

const REGISTRY_FILE: &str = "registry.sqlite";
const PLANS_DIR: &str = "plans";

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deserialize a JSON text column, surfacing bad blobs as conversion errors
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Optional variant of `json_column` for nullable blobs
pub(crate) fn json_column_opt<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        serde_json::from_str(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
    })
    .transpose()
}

struct StoreInner {
    root: PathBuf,
    registry: Mutex<Connection>,
    plans: Mutex<HashMap<i64, Arc<Mutex<Connection>>>>,
}

/// Plan header as stored in each plan database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PlanHeader {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Handle to the plan graph store
#[derive(Clone)]
pub struct PlanStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for PlanStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanStore").field("root", &self.inner.root).finish()
    }
}

impl PlanStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        debug!(root = %root.display(), "PlanStore::open: called");
        fs::create_dir_all(root.join(PLANS_DIR))?;

        let mut registry = Connection::open(root.join(REGISTRY_FILE))?;
        schema::configure(&registry)?;
        schema::migrate(&mut registry, schema::REGISTRY_MIGRATIONS)?;

        info!(root = %root.display(), "PlanStore opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                registry: Mutex::new(registry),
                plans: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn plan_db_path(&self, plan_id: i64) -> PathBuf {
        self.inner.root.join(PLANS_DIR).join(format!("plan_{}.sqlite", plan_id))
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Connection> {
        lock(&self.inner.registry)
    }

    fn plan_exists(&self, plan_id: i64) -> StoreResult<bool> {
        let conn = self.registry();
        let found: Option<i64> = conn
            .query_row("SELECT id FROM plans WHERE id = ?1", params![plan_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Connection for a plan database, opened and migrated on first use
    pub(crate) fn plan_conn(&self, plan_id: i64) -> StoreResult<Arc<Mutex<Connection>>> {
        if let Some(conn) = lock(&self.inner.plans).get(&plan_id) {
            return Ok(Arc::clone(conn));
        }

        if !self.plan_exists(plan_id)? {
            return Err(StoreError::plan_not_found(plan_id));
        }

        let mut conn = Connection::open(self.plan_db_path(plan_id))?;
        schema::configure(&conn)?;
        schema::migrate(&mut conn, schema::PLAN_MIGRATIONS)?;
        debug!(plan_id, "plan_conn: opened plan database");

        let mut plans = lock(&self.inner.plans);
        let conn = plans.entry(plan_id).or_insert_with(|| Arc::new(Mutex::new(conn)));
        Ok(Arc::clone(conn))
    }

    /// Run `f` against a plan's connection while holding its lock
    pub(crate) fn with_plan<T>(
        &self,
        plan_id: i64,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.plan_conn(plan_id)?;
        let mut guard = lock(&conn);
        f(&mut *guard)
    }

    // === Plan operations ===

    /// Allocate a plan id and initialise its database
    pub fn create_plan(
        &self,
        title: &str,
        description: Option<&str>,
        metadata: Map<String, Value>,
    ) -> StoreResult<PlanTree> {
        debug!(%title, "create_plan: called");
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidArgument("plan title must not be empty".to_string()));
        }

        let now = now_ms();
        let metadata_json = serde_json::to_string(&metadata)?;
        let plan_id = {
            let conn = self.registry();
            conn.execute(
                "INSERT INTO plans (title, description, metadata, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![title, description, metadata_json, now],
            )?;
            conn.last_insert_rowid()
        };

        self.with_plan(plan_id, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO plan_meta (id, title, description, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![plan_id, title, description, metadata_json, now],
            )?;
            Ok(())
        })?;

        info!(plan_id, %title, "Created plan");
        Ok(PlanTree::new(plan_id, title, description.map(str::to_string), metadata))
    }

    /// All plans in the registry, oldest first
    pub fn list_plans(&self) -> StoreResult<Vec<PlanSummary>> {
        debug!("list_plans: called");
        let rows: Vec<(i64, String, Option<String>, i64, i64)> = {
            let conn = self.registry();
            let mut stmt =
                conn.prepare("SELECT id, title, description, created_at, updated_at FROM plans ORDER BY id")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)))?
                .collect::<Result<_, _>>()?
        };

        let mut plans = Vec::with_capacity(rows.len());
        for (id, title, description, created_at, updated_at) in rows {
            let task_count = self.with_plan(id, |conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
                Ok(count as usize)
            })?;
            plans.push(PlanSummary {
                id,
                title,
                description,
                task_count,
                created_at,
                updated_at,
            });
        }
        Ok(plans)
    }

    /// Remove a plan and its database
    pub fn delete_plan(&self, plan_id: i64) -> StoreResult<()> {
        debug!(plan_id, "delete_plan: called");
        {
            let conn = self.registry();
            let removed = conn.execute("DELETE FROM plans WHERE id = ?1", params![plan_id])?;
            if removed == 0 {
                return Err(StoreError::plan_not_found(plan_id));
            }
            conn.execute("DELETE FROM job_index WHERE plan_id = ?1", params![plan_id])?;
        }

        lock(&self.inner.plans).remove(&plan_id);

        let db_path = self.plan_db_path(plan_id);
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        info!(plan_id, "Deleted plan");
        Ok(())
    }

    pub(crate) fn load_header(conn: &Connection, plan_id: i64) -> StoreResult<PlanHeader> {
        conn.query_row(
            "SELECT id, title, description, metadata FROM plan_meta WHERE id = ?1",
            params![plan_id],
            |row| {
                Ok(PlanHeader {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    metadata: json_column(row, 3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::plan_not_found(plan_id))
    }

    /// Bump the registry's updated_at for a plan
    pub(crate) fn touch_plan(&self, plan_id: i64) -> StoreResult<()> {
        let conn = self.registry();
        conn.execute(
            "UPDATE plans SET updated_at = ?2 WHERE id = ?1",
            params![plan_id, now_ms()],
        )?;
        Ok(())
    }
}

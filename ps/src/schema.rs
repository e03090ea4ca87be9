//! Versioned schema migrations
//!
//! Each database records its schema version in `PRAGMA user_version`. Opening
//! a database applies every migration above the recorded version, one
//! transaction per step.

use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::StoreResult;

type Migration = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// Migrations for `registry.sqlite`
pub(crate) const REGISTRY_MIGRATIONS: &[Migration] = &[registry_v1];

/// Migrations for `plans/plan_<id>.sqlite`
pub(crate) const PLAN_MIGRATIONS: &[Migration] = &[plan_v1, plan_v2_context_columns];

/// Connection settings shared by every database
pub(crate) fn configure(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )?;
    Ok(())
}

/// Apply all pending migrations
pub(crate) fn migrate(conn: &mut Connection, migrations: &[Migration]) -> StoreResult<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    debug!(current, target = migrations.len(), "migrate: called");

    for (idx, migration) in migrations.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        migration(&tx)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, "Applied schema migration");
    }

    Ok(())
}

/// Job mirror tables, present in both the registry and every plan database
fn job_mirror_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS decomposition_jobs (
          job_id TEXT PRIMARY KEY,
          plan_id INTEGER,
          task_id INTEGER,
          mode TEXT NOT NULL,
          status TEXT NOT NULL,
          created_at INTEGER NOT NULL,
          started_at INTEGER,
          finished_at INTEGER,
          error TEXT,
          result TEXT,
          stats TEXT NOT NULL DEFAULT '{}',
          params TEXT NOT NULL DEFAULT '{}',
          metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS decomposition_job_logs (
          job_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          timestamp INTEGER NOT NULL,
          level TEXT NOT NULL,
          message TEXT NOT NULL,
          metadata TEXT NOT NULL DEFAULT '{}',
          PRIMARY KEY (job_id, seq)
        );

        CREATE TABLE IF NOT EXISTS action_logs (
          job_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          action TEXT NOT NULL,
          payload TEXT NOT NULL DEFAULT '{}',
          created_at INTEGER NOT NULL,
          PRIMARY KEY (job_id, seq)
        );
        "#,
    )
}

fn registry_v1(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS plans (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT NOT NULL,
          description TEXT,
          metadata TEXT NOT NULL DEFAULT '{}',
          created_at INTEGER NOT NULL,
          updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_index (
          job_id TEXT PRIMARY KEY,
          plan_id INTEGER,
          created_at INTEGER NOT NULL
        );
        "#,
    )?;
    job_mirror_tables(tx)
}

fn plan_v1(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS plan_meta (
          id INTEGER PRIMARY KEY,
          title TEXT NOT NULL,
          description TEXT,
          metadata TEXT NOT NULL DEFAULT '{}',
          created_at INTEGER NOT NULL,
          updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'pending',
          instruction TEXT,
          parent_id INTEGER,
          position INTEGER NOT NULL DEFAULT 0,
          depth INTEGER NOT NULL DEFAULT 0,
          path TEXT NOT NULL DEFAULT '',
          metadata TEXT NOT NULL DEFAULT '{}',
          execution_result TEXT,
          created_at INTEGER NOT NULL,
          updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id, position);
        CREATE INDEX IF NOT EXISTS idx_tasks_path ON tasks(path);

        CREATE TABLE IF NOT EXISTS task_dependencies (
          task_id INTEGER NOT NULL,
          depends_on_id INTEGER NOT NULL,
          created_at INTEGER NOT NULL,
          PRIMARY KEY (task_id, depends_on_id),
          FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
          FOREIGN KEY (depends_on_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_deps_target ON task_dependencies(depends_on_id);

        CREATE TABLE IF NOT EXISTS plan_snapshots (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          created_at INTEGER NOT NULL,
          note TEXT,
          payload TEXT NOT NULL
        );
        "#,
    )?;
    job_mirror_tables(tx)
}

fn plan_v2_context_columns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        ALTER TABLE tasks ADD COLUMN context_combined TEXT;
        ALTER TABLE tasks ADD COLUMN context_sections TEXT NOT NULL DEFAULT '[]';
        ALTER TABLE tasks ADD COLUMN context_meta TEXT NOT NULL DEFAULT '{}';
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_version(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_plan_migrations_reach_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, PLAN_MIGRATIONS).unwrap();
        assert_eq!(user_version(&conn), PLAN_MIGRATIONS.len() as i64);

        // context columns exist after v2
        conn.execute(
            "INSERT INTO tasks (name, context_sections, created_at, updated_at) VALUES ('t', '[]', 0, 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, REGISTRY_MIGRATIONS).unwrap();
        migrate(&mut conn, REGISTRY_MIGRATIONS).unwrap();
        assert_eq!(user_version(&conn), REGISTRY_MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_migrate_resumes_from_recorded_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &PLAN_MIGRATIONS[..1]).unwrap();
        assert_eq!(user_version(&conn), 1);
        migrate(&mut conn, PLAN_MIGRATIONS).unwrap();
        assert_eq!(user_version(&conn), 2);
    }
}

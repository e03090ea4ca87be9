//! Dependency edge validation
//!
//! An edge `task -> depends_on` is rejected when it is a self reference,
//! points at a task outside the plan, points at one of the task's ancestors,
//! or would close a cycle in the dependency graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PlanStore;
use crate::error::{StoreError, StoreResult};
use crate::now_ms;

/// Why an edge was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeRejection {
    SelfReference,
    Missing,
    Ancestor,
    Cycle,
}

impl EdgeRejection {
    pub(crate) fn describe(&self, task_id: i64, dep_id: i64) -> String {
        match self {
            Self::SelfReference => format!("task {} cannot depend on itself", task_id),
            Self::Missing => format!("dependency {} of task {} does not exist in this plan", dep_id, task_id),
            Self::Ancestor => format!("task {} cannot depend on its ancestor {}", task_id, dep_id),
            Self::Cycle => format!("dependency {} -> {} would create a cycle", task_id, dep_id),
        }
    }
}

/// Counts of edges dropped during a bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEdges {
    pub self_refs: usize,
    pub missing: usize,
    pub ancestors: usize,
    pub cycles: usize,
}

impl DroppedEdges {
    pub fn total(&self) -> usize {
        self.self_refs + self.missing + self.ancestors + self.cycles
    }

    pub(crate) fn record(&mut self, rejection: EdgeRejection) {
        match rejection {
            EdgeRejection::SelfReference => self.self_refs += 1,
            EdgeRejection::Missing => self.missing += 1,
            EdgeRejection::Ancestor => self.ancestors += 1,
            EdgeRejection::Cycle => self.cycles += 1,
        }
    }
}

/// In-memory view of task paths and accepted edges
#[derive(Debug, Default)]
pub(crate) struct EdgeValidator {
    paths: HashMap<i64, String>,
    edges: HashMap<i64, BTreeSet<i64>>,
}

impl EdgeValidator {
    pub(crate) fn new(paths: HashMap<i64, String>) -> Self {
        Self {
            paths,
            edges: HashMap::new(),
        }
    }

    /// Load paths and existing edges from a plan database
    pub(crate) fn load(conn: &Connection) -> StoreResult<Self> {
        let mut stmt = conn.prepare("SELECT id, path FROM tasks")?;
        let paths = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<i64, String>, _>>()?;

        let mut validator = Self::new(paths);
        let mut stmt = conn.prepare("SELECT task_id, depends_on_id FROM task_dependencies")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (task_id, dep_id) = row?;
            validator.accept(task_id, dep_id);
        }
        Ok(validator)
    }

    pub(crate) fn contains(&self, task_id: i64, dep_id: i64) -> bool {
        self.edges.get(&task_id).is_some_and(|deps| deps.contains(&dep_id))
    }

    pub(crate) fn check(&self, task_id: i64, dep_id: i64) -> Result<(), EdgeRejection> {
        if task_id == dep_id {
            return Err(EdgeRejection::SelfReference);
        }
        let (Some(task_path), Some(dep_path)) = (self.paths.get(&task_id), self.paths.get(&dep_id)) else {
            return Err(EdgeRejection::Missing);
        };
        if task_path.starts_with(&format!("{}/", dep_path)) {
            return Err(EdgeRejection::Ancestor);
        }
        if self.reaches(dep_id, task_id) {
            return Err(EdgeRejection::Cycle);
        }
        Ok(())
    }

    pub(crate) fn accept(&mut self, task_id: i64, dep_id: i64) {
        self.edges.entry(task_id).or_default().insert(dep_id);
    }

    pub(crate) fn remove(&mut self, task_id: i64, dep_id: i64) {
        if let Some(deps) = self.edges.get_mut(&task_id) {
            deps.remove(&dep_id);
        }
    }

    pub(crate) fn clear_outgoing(&mut self, task_id: i64) {
        self.edges.remove(&task_id);
    }

    /// Edges whose target is now an ancestor of the source
    pub(crate) fn ancestor_edges(&self) -> Vec<(i64, i64)> {
        let mut out = Vec::new();
        for (task_id, deps) in &self.edges {
            for dep_id in deps {
                if self.check_ancestor(*task_id, *dep_id) {
                    out.push((*task_id, *dep_id));
                }
            }
        }
        out.sort();
        out
    }

    fn check_ancestor(&self, task_id: i64, dep_id: i64) -> bool {
        match (self.paths.get(&task_id), self.paths.get(&dep_id)) {
            (Some(task_path), Some(dep_path)) => task_path.starts_with(&format!("{}/", dep_path)),
            _ => false,
        }
    }

    /// BFS over depends-on edges
    fn reaches(&self, from: i64, target: i64) -> bool {
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if let Some(deps) = self.edges.get(&current) {
                for next in deps {
                    if seen.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }
        }
        false
    }
}

/// Replace a task's outgoing edges, dropping invalid ones
pub(crate) fn replace_dependencies(conn: &Connection, task_id: i64, dependencies: &[i64]) -> StoreResult<DroppedEdges> {
    let mut validator = EdgeValidator::load(conn)?;
    validator.clear_outgoing(task_id);
    conn.execute("DELETE FROM task_dependencies WHERE task_id = ?1", params![task_id])?;

    let now = now_ms();
    let mut dropped = DroppedEdges::default();
    for dep_id in dependencies {
        if validator.contains(task_id, *dep_id) {
            continue;
        }
        match validator.check(task_id, *dep_id) {
            Ok(()) => {
                validator.accept(task_id, *dep_id);
                insert_edge(conn, task_id, *dep_id, now)?;
            }
            Err(rejection) => {
                debug!(task_id, dep_id, reason = %rejection.describe(task_id, *dep_id), "replace_dependencies: dropped edge");
                dropped.record(rejection);
            }
        }
    }
    if dropped.total() > 0 {
        warn!(task_id, dropped = dropped.total(), ?dropped, "Dropped invalid dependency edges");
    }
    Ok(dropped)
}

pub(crate) fn insert_edge(conn: &Connection, task_id: i64, dep_id: i64, now: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id, created_at) VALUES (?1, ?2, ?3)",
        params![task_id, dep_id, now],
    )?;
    Ok(())
}

impl PlanStore {
    /// Add one edge; returns false if it already existed
    pub fn add_dependency(&self, plan_id: i64, task_id: i64, depends_on: i64) -> StoreResult<bool> {
        debug!(plan_id, task_id, depends_on, "add_dependency: called");
        let added = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            let validator = EdgeValidator::load(&tx)?;
            if validator.contains(task_id, depends_on) {
                return Ok(false);
            }
            match validator.check(task_id, depends_on) {
                Ok(()) => {}
                Err(EdgeRejection::Missing) => {
                    let missing = if validator.paths.contains_key(&task_id) {
                        depends_on
                    } else {
                        task_id
                    };
                    return Err(StoreError::task_not_found(plan_id, missing));
                }
                Err(rejection) => return Err(StoreError::InvalidArgument(rejection.describe(task_id, depends_on))),
            }
            insert_edge(&tx, task_id, depends_on, now_ms())?;
            tx.commit()?;
            Ok(true)
        })?;
        if added {
            self.touch_plan(plan_id)?;
            info!(plan_id, task_id, depends_on, "Added dependency");
        }
        Ok(added)
    }

    /// Remove one edge; returns false if it did not exist
    pub fn remove_dependency(&self, plan_id: i64, task_id: i64, depends_on: i64) -> StoreResult<bool> {
        debug!(plan_id, task_id, depends_on, "remove_dependency: called");
        let removed = self.with_plan(plan_id, |conn| {
            let n = conn.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on_id = ?2",
                params![task_id, depends_on],
            )?;
            Ok(n > 0)
        })?;
        if removed {
            self.touch_plan(plan_id)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn validator() -> EdgeValidator {
        // 1 is the root, 2 and 3 are its children, 4 is under 2
        EdgeValidator::new(HashMap::from([
            (1, "/1".to_string()),
            (2, "/1/2".to_string()),
            (3, "/1/3".to_string()),
            (4, "/1/2/4".to_string()),
        ]))
    }

    #[test]
    fn test_rejects_self_reference() {
        assert_eq!(validator().check(2, 2), Err(EdgeRejection::SelfReference));
    }

    #[test]
    fn test_rejects_missing_target() {
        assert_eq!(validator().check(2, 99), Err(EdgeRejection::Missing));
    }

    #[test]
    fn test_rejects_ancestor() {
        let v = validator();
        assert_eq!(v.check(4, 2), Err(EdgeRejection::Ancestor));
        assert_eq!(v.check(4, 1), Err(EdgeRejection::Ancestor));
        // descendant is fine
        assert_eq!(v.check(2, 4), Ok(()));
    }

    #[test]
    fn test_rejects_cycle() {
        let mut v = validator();
        v.accept(2, 3);
        v.accept(3, 4);
        assert_eq!(v.check(4, 2), Err(EdgeRejection::Ancestor));
        assert_eq!(v.check(4, 3), Err(EdgeRejection::Cycle));
        v.remove(3, 4);
        assert_eq!(v.check(4, 3), Ok(()));
    }

    #[test]
    fn test_ancestor_edges_detected_after_reparent() {
        let mut v = validator();
        v.accept(3, 2);
        assert!(v.ancestor_edges().is_empty());
        // 3 moved under 2
        v.paths.insert(3, "/1/2/3".to_string());
        assert_eq!(v.ancestor_edges(), vec![(3, 2)]);
    }

    #[test]
    fn test_dropped_edges_total() {
        let mut dropped = DroppedEdges::default();
        dropped.record(EdgeRejection::Cycle);
        dropped.record(EdgeRejection::Missing);
        dropped.record(EdgeRejection::Missing);
        assert_eq!(dropped.total(), 3);
        assert_eq!(dropped.missing, 2);
    }

    proptest! {
        // Accepting only edges that pass `check` must never produce a cycle
        #[test]
        fn prop_accepted_edges_stay_acyclic(edges in proptest::collection::vec((1i64..=8, 1i64..=8), 0..40)) {
            let paths = (1..=8).map(|id| (id, format!("/{}", id))).collect();
            let mut v = EdgeValidator::new(paths);
            for (task, dep) in edges {
                if v.check(task, dep).is_ok() {
                    v.accept(task, dep);
                }
            }
            for (task, deps) in v.edges.clone() {
                for dep in deps {
                    prop_assert!(!v.reaches(dep, task));
                }
            }
        }
    }
}

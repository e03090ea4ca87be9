//! Task CRUD and sibling ordering

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use super::deps::{self, EdgeValidator};
use super::{PlanStore, json_column, json_column_opt};
use crate::error::{StoreError, StoreResult};
use crate::model::{AnchorKind, NewTask, NodeContext, NodeStatus, PlanNode, TaskUpdate};
use crate::now_ms;

pub(crate) const TASK_COLUMNS: &str = "id, name, status, instruction, parent_id, position, depth, path, metadata, \
     execution_result, created_at, updated_at, context_combined, context_sections, context_meta";

/// Parse a row selected with `TASK_COLUMNS`; dependencies are filled separately
pub(crate) fn parse_task_row(row: &Row<'_>, plan_id: i64) -> rusqlite::Result<PlanNode> {
    let status: String = row.get(2)?;
    let status = status.parse::<NodeStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PlanNode {
        id: row.get(0)?,
        plan_id,
        name: row.get(1)?,
        status,
        instruction: row.get(3)?,
        parent_id: row.get(4)?,
        position: row.get(5)?,
        depth: row.get(6)?,
        path: row.get(7)?,
        metadata: json_column(row, 8)?,
        dependencies: BTreeSet::new(),
        execution_result: json_column_opt(row, 9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        context: NodeContext {
            combined: row.get(12)?,
            sections: json_column(row, 13)?,
            meta: json_column(row, 14)?,
        },
    })
}

pub(crate) fn load_dependencies(conn: &Connection, task_id: i64) -> StoreResult<BTreeSet<i64>> {
    let mut stmt = conn.prepare("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1")?;
    let deps = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<Result<BTreeSet<i64>, _>>()?;
    Ok(deps)
}

/// Load one task with its dependencies
pub(crate) fn load_node(conn: &Connection, plan_id: i64, task_id: i64) -> StoreResult<PlanNode> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    let mut node = conn
        .query_row(&sql, params![task_id], |row| parse_task_row(row, plan_id))
        .optional()?
        .ok_or_else(|| StoreError::task_not_found(plan_id, task_id))?;
    node.dependencies = load_dependencies(conn, task_id)?;
    Ok(node)
}

/// Sibling ids under `parent_id` in (position, id) order
pub(crate) fn sibling_ids(conn: &Connection, parent_id: Option<i64>) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM tasks WHERE parent_id IS ?1 ORDER BY position, id")?;
    let ids = stmt
        .query_map(params![parent_id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Write positions 0..N-1 following `ids`
pub(crate) fn write_order(conn: &Connection, ids: &[i64]) -> StoreResult<()> {
    let mut stmt = conn.prepare("UPDATE tasks SET position = ?2 WHERE id = ?1 AND position != ?2")?;
    for (idx, id) in ids.iter().enumerate() {
        stmt.execute(params![id, idx as i64])?;
    }
    Ok(())
}

/// Close any gaps in a sibling group
pub(crate) fn resequence(conn: &Connection, parent_id: Option<i64>) -> StoreResult<()> {
    let ids = sibling_ids(conn, parent_id)?;
    write_order(conn, &ids)
}

fn child_path(parent: Option<&PlanNode>, id: i64) -> String {
    match parent {
        Some(p) => format!("{}/{}", p.path, id),
        None => format!("/{}", id),
    }
}

fn check_position(position: Option<i64>) -> StoreResult<()> {
    match position {
        Some(p) if p < 0 => Err(StoreError::InvalidArgument(format!("position must be >= 0, got {}", p))),
        _ => Ok(()),
    }
}

/// Resolve the parent and insertion index for a new task
fn resolve_placement(conn: &Connection, plan_id: i64, task: &NewTask) -> StoreResult<(Option<PlanNode>, i64)> {
    if let Some(anchor) = task.anchor {
        let target = load_node(conn, plan_id, anchor.task_id)?;
        let (parent_id, index) = match anchor.kind {
            AnchorKind::Before => (target.parent_id, target.position),
            AnchorKind::After => (target.parent_id, target.position + 1),
            AnchorKind::FirstChild => (Some(target.id), 0),
            AnchorKind::LastChild => (Some(target.id), sibling_ids(conn, Some(target.id))?.len() as i64),
        };
        if task.parent_id.is_some() && task.parent_id != parent_id {
            return Err(StoreError::InvalidArgument(format!(
                "anchor {:?} on task {} conflicts with parent {:?}",
                anchor.kind, anchor.task_id, task.parent_id
            )));
        }
        let parent = match parent_id {
            Some(pid) if pid == target.id => Some(target),
            Some(pid) => Some(load_node(conn, plan_id, pid)?),
            None => None,
        };
        return Ok((parent, index));
    }

    let parent = match task.parent_id {
        Some(pid) => Some(load_node(conn, plan_id, pid)?),
        None => None,
    };
    let count = sibling_ids(conn, task.parent_id)?.len() as i64;
    let index = task.position.map(|p| p.min(count)).unwrap_or(count);
    Ok((parent, index))
}

impl PlanStore {
    /// Fetch one task
    pub fn get_node(&self, plan_id: i64, task_id: i64) -> StoreResult<PlanNode> {
        debug!(plan_id, task_id, "get_node: called");
        self.with_plan(plan_id, |conn| load_node(conn, plan_id, task_id))
    }

    /// Insert a task at the requested place in its sibling group
    pub fn create_task(&self, plan_id: i64, task: NewTask) -> StoreResult<PlanNode> {
        debug!(plan_id, name = %task.name, parent_id = ?task.parent_id, "create_task: called");
        if task.name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("task name must not be empty".to_string()));
        }
        check_position(task.position)?;

        let node = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            let (parent, index) = resolve_placement(&tx, plan_id, &task)?;
            let parent_id = parent.as_ref().map(|p| p.id);
            let depth = parent.as_ref().map(|p| p.depth + 1).unwrap_or(0);

            tx.execute(
                "UPDATE tasks SET position = position + 1 WHERE parent_id IS ?1 AND position >= ?2",
                params![parent_id, index],
            )?;

            let now = now_ms();
            tx.execute(
                "INSERT INTO tasks (name, status, instruction, parent_id, position, depth, path, metadata,
                                    created_at, updated_at, context_combined, context_sections, context_meta)
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?5, '', ?6, ?7, ?7, ?8, ?9, ?10)",
                params![
                    task.name.trim(),
                    task.instruction,
                    parent_id,
                    index,
                    depth,
                    serde_json::to_string(&task.metadata)?,
                    now,
                    task.context.combined,
                    serde_json::to_string(&task.context.sections)?,
                    serde_json::to_string(&task.context.meta)?,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE tasks SET path = ?2 WHERE id = ?1",
                params![id, child_path(parent.as_ref(), id)],
            )?;

            if !task.dependencies.is_empty() {
                deps::replace_dependencies(&tx, id, &task.dependencies)?;
            }

            let node = load_node(&tx, plan_id, id)?;
            tx.commit()?;
            Ok(node)
        })?;

        self.touch_plan(plan_id)?;
        info!(plan_id, task_id = node.id, name = %node.name, "Created task");
        Ok(node)
    }

    /// Apply a partial update; dependencies, when present, replace the edge set
    pub fn update_task(&self, plan_id: i64, task_id: i64, update: TaskUpdate) -> StoreResult<PlanNode> {
        debug!(plan_id, task_id, "update_task: called");
        if let Some(name) = &update.name
            && name.trim().is_empty()
        {
            return Err(StoreError::InvalidArgument("task name must not be empty".to_string()));
        }

        let node = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            let mut node = load_node(&tx, plan_id, task_id)?;

            if let Some(name) = update.name {
                node.name = name.trim().to_string();
            }
            if let Some(status) = update.status {
                node.status = status;
            }
            if let Some(instruction) = update.instruction {
                node.instruction = Some(instruction);
            }
            if let Some(metadata) = update.metadata {
                node.metadata = metadata;
            }
            if let Some(context) = update.context {
                node.context = context;
            }
            if let Some(result) = update.execution_result {
                node.execution_result = Some(result);
            }
            node.updated_at = now_ms();

            tx.execute(
                "UPDATE tasks SET name = ?2, status = ?3, instruction = ?4, metadata = ?5, execution_result = ?6,
                        updated_at = ?7, context_combined = ?8, context_sections = ?9, context_meta = ?10
                 WHERE id = ?1",
                params![
                    task_id,
                    node.name,
                    node.status.as_str(),
                    node.instruction,
                    serde_json::to_string(&node.metadata)?,
                    node.execution_result.as_ref().map(serde_json::to_string).transpose()?,
                    node.updated_at,
                    node.context.combined,
                    serde_json::to_string(&node.context.sections)?,
                    serde_json::to_string(&node.context.meta)?,
                ],
            )?;

            if let Some(dependencies) = update.dependencies {
                deps::replace_dependencies(&tx, task_id, &dependencies)?;
                node.dependencies = load_dependencies(&tx, task_id)?;
            }

            tx.commit()?;
            Ok(node)
        })?;

        self.touch_plan(plan_id)?;
        Ok(node)
    }

    /// Reparent and/or reorder a task; `None` parent moves it to the root level
    pub fn move_task(
        &self,
        plan_id: i64,
        task_id: i64,
        new_parent_id: Option<i64>,
        new_position: Option<i64>,
    ) -> StoreResult<PlanNode> {
        debug!(plan_id, task_id, ?new_parent_id, ?new_position, "move_task: called");
        check_position(new_position)?;

        let node = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            let node = load_node(&tx, plan_id, task_id)?;

            let parent = match new_parent_id {
                Some(pid) if pid == task_id => {
                    return Err(StoreError::InvalidArgument(format!("task {} cannot be its own parent", task_id)));
                }
                Some(pid) => {
                    let parent = load_node(&tx, plan_id, pid)?;
                    if parent.is_descendant_of(&node) {
                        return Err(StoreError::InvalidArgument(format!(
                            "cannot move task {} under its descendant {}",
                            task_id, pid
                        )));
                    }
                    Some(parent)
                }
                None => None,
            };

            let old_parent_id = node.parent_id;
            let old_path = node.path.clone();
            let new_path = child_path(parent.as_ref(), task_id);
            let new_depth = parent.as_ref().map(|p| p.depth + 1).unwrap_or(0);
            let depth_delta = new_depth - node.depth;

            tx.execute(
                "UPDATE tasks SET parent_id = ?2, depth = ?3, path = ?4, updated_at = ?5 WHERE id = ?1",
                params![task_id, new_parent_id, new_depth, new_path, now_ms()],
            )?;

            if old_path != new_path {
                let prefix = format!("{}/", old_path);
                tx.execute(
                    "UPDATE tasks SET path = ?1 || substr(path, ?2), depth = depth + ?3
                     WHERE substr(path, 1, ?4) = ?5",
                    params![
                        new_path,
                        old_path.len() as i64 + 1,
                        depth_delta,
                        prefix.len() as i64,
                        prefix
                    ],
                )?;
            }

            // destination order, with the moved task spliced in
            let mut siblings: Vec<i64> = sibling_ids(&tx, new_parent_id)?
                .into_iter()
                .filter(|id| *id != task_id)
                .collect();
            let index = new_position
                .map(|p| p.min(siblings.len() as i64))
                .unwrap_or(siblings.len() as i64) as usize;
            siblings.insert(index, task_id);
            write_order(&tx, &siblings)?;

            if old_parent_id != new_parent_id {
                resequence(&tx, old_parent_id)?;
            }

            // reparenting can turn an existing edge into an ancestor edge
            let validator = EdgeValidator::load(&tx)?;
            let stale = validator.ancestor_edges();
            if !stale.is_empty() {
                warn!(plan_id, task_id, count = stale.len(), "move_task: dropping dependencies on new ancestors");
                for (from, to) in stale {
                    tx.execute(
                        "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on_id = ?2",
                        params![from, to],
                    )?;
                }
            }

            let node = load_node(&tx, plan_id, task_id)?;
            tx.commit()?;
            Ok(node)
        })?;

        self.touch_plan(plan_id)?;
        info!(plan_id, task_id, parent_id = ?node.parent_id, position = node.position, "Moved task");
        Ok(node)
    }

    /// Delete a task and its subtree; returns the removed ids
    pub fn delete_task(&self, plan_id: i64, task_id: i64) -> StoreResult<Vec<i64>> {
        debug!(plan_id, task_id, "delete_task: called");
        let removed = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            let node = load_node(&tx, plan_id, task_id)?;
            let prefix = format!("{}/", node.path);

            let removed: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM tasks WHERE id = ?1 OR substr(path, 1, ?2) = ?3 ORDER BY depth DESC, id")?;
                stmt.query_map(params![task_id, prefix.len() as i64, prefix], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };

            {
                let mut drop_edges =
                    tx.prepare("DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on_id = ?1")?;
                let mut drop_task = tx.prepare("DELETE FROM tasks WHERE id = ?1")?;
                for id in &removed {
                    drop_edges.execute(params![id])?;
                    drop_task.execute(params![id])?;
                }
            }

            resequence(&tx, node.parent_id)?;
            tx.commit()?;
            Ok(removed)
        })?;

        self.touch_plan(plan_id)?;
        info!(plan_id, task_id, removed = removed.len(), "Deleted task subtree");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContextSection;
    use proptest::prelude::*;
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn setup() -> (TempDir, PlanStore, i64) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let plan = store.create_plan("Plan", None, Map::new()).unwrap();
        (dir, store, plan.id)
    }

    fn positions(store: &PlanStore, plan_id: i64, parent: Option<i64>) -> Vec<(String, i64)> {
        let tree = store.get_tree(plan_id).unwrap();
        tree.children_of(parent)
            .iter()
            .map(|id| {
                let n = tree.get(*id).unwrap();
                (n.name.clone(), n.position)
            })
            .collect()
    }

    #[test]
    fn test_create_task_appends_and_sets_path() {
        let (_dir, store, plan) = setup();
        let root = store.create_task(plan, NewTask::new("Root")).unwrap();
        let child = store.create_task(plan, NewTask::new("Child").with_parent(root.id)).unwrap();

        assert_eq!(root.path, format!("/{}", root.id));
        assert_eq!(root.depth, 0);
        assert_eq!(child.path, format!("/{}/{}", root.id, child.id));
        assert_eq!(child.depth, 1);
        assert_eq!(child.status, NodeStatus::Pending);
    }

    #[test]
    fn test_create_task_explicit_position_shifts_siblings() {
        let (_dir, store, plan) = setup();
        store.create_task(plan, NewTask::new("A")).unwrap();
        store.create_task(plan, NewTask::new("B")).unwrap();
        store.create_task(plan, NewTask::new("First").with_position(0)).unwrap();
        store.create_task(plan, NewTask::new("Last").with_position(99)).unwrap();

        assert_eq!(
            positions(&store, plan, None),
            vec![
                ("First".to_string(), 0),
                ("A".to_string(), 1),
                ("B".to_string(), 2),
                ("Last".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_create_task_with_anchors() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let c = store.create_task(plan, NewTask::new("C")).unwrap();
        store.create_task(plan, NewTask::new("B").with_anchor(AnchorKind::After, a.id)).unwrap();
        store.create_task(plan, NewTask::new("Z").with_anchor(AnchorKind::Before, a.id)).unwrap();
        let names: Vec<String> = positions(&store, plan, None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Z", "A", "B", "C"]);

        store.create_task(plan, NewTask::new("c2").with_anchor(AnchorKind::LastChild, c.id)).unwrap();
        store.create_task(plan, NewTask::new("c1").with_anchor(AnchorKind::FirstChild, c.id)).unwrap();
        let kids: Vec<String> = positions(&store, plan, Some(c.id)).into_iter().map(|(n, _)| n).collect();
        assert_eq!(kids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_create_task_anchor_parent_mismatch() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store.create_task(plan, NewTask::new("B")).unwrap();
        let err = store
            .create_task(plan, NewTask::new("X").with_parent(b.id).with_anchor(AnchorKind::After, a.id))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_task_rejects_negative_position_and_missing_parent() {
        let (_dir, store, plan) = setup();
        let err = store.create_task(plan, NewTask::new("X").with_position(-1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        let err = store.create_task(plan, NewTask::new("X").with_parent(404)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_task_filters_dependencies() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store
            .create_task(plan, NewTask::new("B").with_dependencies(vec![a.id, a.id]))
            .unwrap();
        assert_eq!(b.dependencies.iter().copied().collect::<Vec<_>>(), vec![a.id]);

        // missing target is dropped, the task is still created
        let c = store
            .create_task(plan, NewTask::new("C").with_dependencies(vec![999, b.id]))
            .unwrap();
        assert_eq!(c.dependencies.iter().copied().collect::<Vec<_>>(), vec![b.id]);

        // a child cannot depend on its parent
        let c1 = store
            .create_task(plan, NewTask::new("C1").with_parent(c.id).with_dependencies(vec![c.id]))
            .unwrap();
        assert!(c1.dependencies.is_empty());
    }

    #[test]
    fn test_update_task_fields_and_dependencies() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store.create_task(plan, NewTask::new("B")).unwrap();

        let mut ctx = NodeContext::default();
        ctx.sections.push(ContextSection::new("Notes", "be careful"));
        let updated = store
            .update_task(
                plan,
                b.id,
                TaskUpdate {
                    name: Some("B2".into()),
                    status: Some(NodeStatus::Completed),
                    dependencies: Some(vec![a.id]),
                    context: Some(ctx.clone()),
                    execution_result: Some(json!({"content": "done"})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "B2");
        assert_eq!(updated.status, NodeStatus::Completed);
        assert!(updated.dependencies.contains(&a.id));
        assert_eq!(updated.result_content(), Some("done"));

        let reloaded = store.get_node(plan, b.id).unwrap();
        assert_eq!(reloaded.context, ctx);

        // reverse edge would be a cycle and is dropped
        let a2 = store
            .update_task(
                plan,
                a.id,
                TaskUpdate {
                    dependencies: Some(vec![b.id]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(a2.dependencies.is_empty());
        assert!(store.get_node(plan, b.id).unwrap().dependencies.contains(&a.id));
    }

    #[test]
    fn test_update_missing_task() {
        let (_dir, store, plan) = setup();
        let err = store.update_task(plan, 12, TaskUpdate::default()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_move_task_rewrites_subtree_paths() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store.create_task(plan, NewTask::new("B")).unwrap();
        let a1 = store.create_task(plan, NewTask::new("A1").with_parent(a.id)).unwrap();
        let a1x = store.create_task(plan, NewTask::new("A1x").with_parent(a1.id)).unwrap();

        let moved = store.move_task(plan, a1.id, Some(b.id), None).unwrap();
        assert_eq!(moved.path, format!("/{}/{}", b.id, a1.id));
        assert_eq!(moved.depth, 1);

        let grandchild = store.get_node(plan, a1x.id).unwrap();
        assert_eq!(grandchild.path, format!("/{}/{}/{}", b.id, a1.id, a1x.id));
        assert_eq!(grandchild.depth, 2);

        let to_root = store.move_task(plan, a1.id, None, Some(0)).unwrap();
        assert_eq!(to_root.depth, 0);
        assert_eq!(to_root.position, 0);
        assert_eq!(store.get_node(plan, a1x.id).unwrap().depth, 1);
        let names: Vec<String> = positions(&store, plan, None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["A1", "A", "B"]);
    }

    #[test]
    fn test_move_task_rejects_descendant_and_self() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let child = store.create_task(plan, NewTask::new("C").with_parent(a.id)).unwrap();

        let err = store.move_task(plan, a.id, Some(child.id), None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        let err = store.move_task(plan, a.id, Some(a.id), None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_move_within_parent_reorders() {
        let (_dir, store, plan) = setup();
        for name in ["A", "B", "C"] {
            store.create_task(plan, NewTask::new(name)).unwrap();
        }
        let c = store.get_tree(plan).unwrap().roots()[2];
        store.move_task(plan, c, None, Some(0)).unwrap();
        assert_eq!(
            positions(&store, plan, None),
            vec![("C".to_string(), 0), ("A".to_string(), 1), ("B".to_string(), 2)]
        );
    }

    #[test]
    fn test_move_drops_edges_onto_new_ancestor() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store.create_task(plan, NewTask::new("B").with_dependencies(vec![a.id])).unwrap();
        let moved = store.move_task(plan, b.id, Some(a.id), None).unwrap();
        assert!(moved.dependencies.is_empty());
    }

    #[test]
    fn test_delete_task_removes_subtree_and_resequences() {
        let (_dir, store, plan) = setup();
        let a = store.create_task(plan, NewTask::new("A")).unwrap();
        let b = store.create_task(plan, NewTask::new("B")).unwrap();
        let c = store.create_task(plan, NewTask::new("C").with_dependencies(vec![b.id])).unwrap();
        store.create_task(plan, NewTask::new("B1").with_parent(b.id)).unwrap();

        let removed = store.delete_task(plan, b.id).unwrap();
        assert_eq!(removed.len(), 2);

        assert_eq!(
            positions(&store, plan, None),
            vec![("A".to_string(), 0), ("C".to_string(), 1)]
        );
        assert!(store.get_node(plan, c.id).unwrap().dependencies.is_empty());
        assert!(store.get_node(plan, a.id).is_ok());
        assert!(store.delete_task(plan, b.id).unwrap_err().is_not_found());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create { parent: usize, position: Option<i64> },
        Move { task: usize, parent: usize, position: Option<i64> },
        Delete { task: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..8, proptest::option::of(0i64..6)).prop_map(|(parent, position)| Op::Create { parent, position }),
            (0usize..8, 0usize..8, proptest::option::of(0i64..6))
                .prop_map(|(task, parent, position)| Op::Move { task, parent, position }),
            (0usize..8).prop_map(|task| Op::Delete { task }),
        ]
    }

    // index 0 picks the root level, anything else an existing task (if any)
    fn pick(ids: &[i64], idx: usize) -> Option<i64> {
        if idx == 0 || ids.is_empty() {
            None
        } else {
            Some(ids[idx % ids.len()])
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_structure_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..20)) {
            let (_dir, store, plan) = setup();
            for op in ops {
                let ids: Vec<i64> = store.get_tree(plan).unwrap().nodes.keys().copied().collect();
                match op {
                    Op::Create { parent, position } => {
                        let mut task = NewTask::new("t");
                        task.parent_id = pick(&ids, parent);
                        task.position = position;
                        store.create_task(plan, task).unwrap();
                    }
                    Op::Move { task, parent, position } => {
                        if let Some(task_id) = pick(&ids, task + 1) {
                            // moves under a descendant are expected to fail
                            let _ = store.move_task(plan, task_id, pick(&ids, parent), position);
                        }
                    }
                    Op::Delete { task } => {
                        if let Some(task_id) = pick(&ids, task + 1) {
                            store.delete_task(plan, task_id).unwrap();
                        }
                    }
                }
            }

            let tree = store.get_tree(plan).unwrap();
            for node in tree.nodes.values() {
                match node.parent_id {
                    None => {
                        prop_assert_eq!(node.depth, 0);
                        prop_assert_eq!(&node.path, &format!("/{}", node.id));
                    }
                    Some(pid) => {
                        let parent = tree.get(pid).unwrap();
                        prop_assert_eq!(node.depth, parent.depth + 1);
                        prop_assert_eq!(&node.path, &format!("{}/{}", parent.path, node.id));
                    }
                }
            }
            let mut parents: Vec<Option<i64>> = vec![None];
            parents.extend(tree.nodes.keys().map(|id| Some(*id)));
            for parent in parents {
                let positions: Vec<i64> = tree.children_of(parent).iter().map(|id| tree.get(*id).unwrap().position).collect();
                let expected: Vec<i64> = (0..positions.len() as i64).collect();
                prop_assert_eq!(positions, expected);
            }
        }
    }
}

//! Whole-tree reads, bulk upsert, subgraph projection and snapshots

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use rusqlite::{Connection, ToSql, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::deps::{DroppedEdges, EdgeValidator, insert_edge};
use super::tasks::{TASK_COLUMNS, load_node, parse_task_row};
use super::{PlanStore, json_column};
use crate::error::StoreResult;
use crate::model::{PlanNode, PlanTree};
use crate::now_ms;

/// Outcome of `upsert_tree`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub tasks: usize,
    pub edges: usize,
    pub dropped: DroppedEdges,
    pub snapshot_id: Option<i64>,
}

/// Stored audit snapshot of a whole plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub created_at: i64,
    pub note: Option<String>,
    pub tree: PlanTree,
}

/// Load every task of a plan with dependencies attached
fn load_nodes(
    conn: &Connection,
    plan_id: i64,
    sql_filter: &str,
    filter_params: &[&dyn ToSql],
) -> StoreResult<BTreeMap<i64, PlanNode>> {
    let sql = format!("SELECT {} FROM tasks {}", TASK_COLUMNS, sql_filter);
    let mut stmt = conn.prepare(&sql)?;
    let mut nodes = stmt
        .query_map(filter_params, |row| parse_task_row(row, plan_id))?
        .map(|r| r.map(|n| (n.id, n)))
        .collect::<Result<BTreeMap<i64, PlanNode>, _>>()?;

    let mut stmt = conn.prepare("SELECT task_id, depends_on_id FROM task_dependencies")?;
    let edges = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    for edge in edges {
        let (task_id, dep_id) = edge?;
        if let Some(node) = nodes.get_mut(&task_id) {
            node.dependencies.insert(dep_id);
        }
    }
    Ok(nodes)
}

fn read_tree(conn: &Connection, plan_id: i64) -> StoreResult<PlanTree> {
    let header = PlanStore::load_header(conn, plan_id)?;
    let mut tree = PlanTree::new(header.id, header.title, header.description, header.metadata);
    tree.nodes = load_nodes(conn, plan_id, "", &[])?;
    tree.rebuild_adjacency();
    Ok(tree)
}

/// Recompute parent links, depth, path and contiguous positions for a tree
/// supplied by a caller. Nodes whose parent is missing, or that sit on a
/// parent cycle, are promoted to roots.
fn normalize(tree: &PlanTree) -> Vec<PlanNode> {
    let mut children: BTreeMap<Option<i64>, Vec<(i64, i64)>> = BTreeMap::new();
    for node in tree.nodes.values() {
        let parent = node.parent_id.filter(|pid| tree.contains(*pid) && *pid != node.id);
        children.entry(parent).or_default().push((node.position, node.id));
    }
    for kids in children.values_mut() {
        kids.sort();
    }

    let mut placed: BTreeMap<i64, PlanNode> = BTreeMap::new();
    let mut root_count = 0i64;
    let mut pending: BTreeSet<i64> = tree.nodes.keys().copied().collect();
    let mut root_queue: VecDeque<i64> = children
        .get(&None)
        .map(|kids| kids.iter().map(|(_, id)| *id).collect())
        .unwrap_or_default();

    loop {
        let Some(root_id) = root_queue.pop_front().or_else(|| pending.iter().next().copied()) else {
            break;
        };
        if !pending.contains(&root_id) {
            continue;
        }

        let mut queue = VecDeque::from([(root_id, None::<(i64, String, i64)>, root_count)]);
        root_count += 1;

        while let Some((id, parent, position)) = queue.pop_front() {
            if !pending.remove(&id) {
                continue;
            }
            let Some(source) = tree.get(id) else { continue };
            let mut node = source.clone();
            match &parent {
                Some((pid, ppath, pdepth)) => {
                    node.parent_id = Some(*pid);
                    node.path = format!("{}/{}", ppath, id);
                    node.depth = pdepth + 1;
                }
                None => {
                    node.parent_id = None;
                    node.path = format!("/{}", id);
                    node.depth = 0;
                }
            }
            node.position = position;

            let kids = children.get(&Some(id)).cloned().unwrap_or_default();
            let mut child_pos = 0;
            for (_, kid) in kids {
                if pending.contains(&kid) {
                    queue.push_back((kid, Some((id, node.path.clone(), node.depth)), child_pos));
                    child_pos += 1;
                }
            }
            placed.insert(id, node);
        }
    }

    placed.into_values().collect()
}

fn insert_snapshot(conn: &Connection, note: Option<&str>, tree: &PlanTree) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO plan_snapshots (created_at, note, payload) VALUES (?1, ?2, ?3)",
        params![now_ms(), note, serde_json::to_string(tree)?],
    )?;
    Ok(conn.last_insert_rowid())
}

impl PlanStore {
    /// Full projection of a plan
    pub fn get_tree(&self, plan_id: i64) -> StoreResult<PlanTree> {
        debug!(plan_id, "get_tree: called");
        self.with_plan(plan_id, |conn| read_tree(conn, plan_id))
    }

    /// Replace the whole plan with `tree`
    ///
    /// Structure is normalized first. Edges that are self references, point
    /// at missing tasks, point at ancestors, or would form a cycle are dropped
    /// and counted in the report. With `snapshot_note` set, the stored result
    /// is also appended to the snapshot log.
    pub fn upsert_tree(&self, plan_id: i64, tree: &PlanTree, snapshot_note: Option<&str>) -> StoreResult<UpsertReport> {
        debug!(plan_id, nodes = tree.len(), "upsert_tree: called");
        let nodes = normalize(tree);

        let report = self.with_plan(plan_id, |conn| {
            let tx = conn.transaction()?;
            PlanStore::load_header(&tx, plan_id)?;

            let now = now_ms();
            tx.execute(
                "UPDATE plan_meta SET title = ?2, description = ?3, metadata = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    plan_id,
                    tree.title,
                    tree.description,
                    serde_json::to_string(&tree.metadata)?,
                    now
                ],
            )?;
            tx.execute("DELETE FROM task_dependencies", [])?;
            tx.execute("DELETE FROM tasks", [])?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO tasks (id, name, status, instruction, parent_id, position, depth, path, metadata,
                                        execution_result, created_at, updated_at, context_combined,
                                        context_sections, context_meta)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                for node in &nodes {
                    stmt.execute(params![
                        node.id,
                        node.name,
                        node.status.as_str(),
                        node.instruction,
                        node.parent_id,
                        node.position,
                        node.depth,
                        node.path,
                        serde_json::to_string(&node.metadata)?,
                        node.execution_result.as_ref().map(serde_json::to_string).transpose()?,
                        if node.created_at > 0 { node.created_at } else { now },
                        now,
                        node.context.combined,
                        serde_json::to_string(&node.context.sections)?,
                        serde_json::to_string(&node.context.meta)?,
                    ])?;
                }
            }

            let paths: HashMap<i64, String> = nodes.iter().map(|n| (n.id, n.path.clone())).collect();
            let mut validator = EdgeValidator::new(paths);
            let mut dropped = DroppedEdges::default();
            let mut edges = 0;
            for node in &nodes {
                for dep_id in &node.dependencies {
                    match validator.check(node.id, *dep_id) {
                        Ok(()) => {
                            validator.accept(node.id, *dep_id);
                            insert_edge(&tx, node.id, *dep_id, now)?;
                            edges += 1;
                        }
                        Err(rejection) => dropped.record(rejection),
                    }
                }
            }

            let snapshot_id = match snapshot_note {
                Some(note) => {
                    let stored = read_tree(&tx, plan_id)?;
                    Some(insert_snapshot(&tx, Some(note), &stored)?)
                }
                None => None,
            };

            tx.commit()?;
            Ok(UpsertReport {
                tasks: nodes.len(),
                edges,
                dropped,
                snapshot_id,
            })
        })?;

        {
            let conn = self.registry();
            conn.execute(
                "UPDATE plans SET title = ?2, description = ?3, metadata = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    plan_id,
                    tree.title,
                    tree.description,
                    serde_json::to_string(&tree.metadata)?,
                    now_ms()
                ],
            )?;
        }

        if report.dropped.total() > 0 {
            warn!(plan_id, dropped = ?report.dropped, "upsert_tree: dropped invalid dependency edges");
        }
        info!(plan_id, tasks = report.tasks, edges = report.edges, "Upserted plan tree");
        Ok(report)
    }

    /// Breadth-first projection of `task_id` and descendants up to `max_depth` levels below it
    pub fn subgraph(&self, plan_id: i64, task_id: i64, max_depth: Option<i64>) -> StoreResult<Vec<PlanNode>> {
        debug!(plan_id, task_id, ?max_depth, "subgraph: called");
        self.with_plan(plan_id, |conn| {
            let start = load_node(conn, plan_id, task_id)?;
            let prefix = format!("{}/", start.path);
            let depth_limit = max_depth.map(|max| start.depth + max.max(0)).unwrap_or(i64::MAX);
            let nodes = load_nodes(
                conn,
                plan_id,
                "WHERE (id = ?1 OR substr(path, 1, ?2) = ?3) AND depth <= ?4",
                &[&start.id, &(prefix.len() as i64), &prefix, &depth_limit],
            )?;

            let mut children: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
            for node in nodes.values() {
                if let Some(pid) = node.parent_id {
                    children.entry(pid).or_default().push((node.position, node.id));
                }
            }

            let mut out = Vec::with_capacity(nodes.len());
            let mut queue = VecDeque::from([start.id]);
            while let Some(id) = queue.pop_front() {
                let Some(node) = nodes.get(&id) else { continue };
                out.push(node.clone());
                if let Some(kids) = children.get_mut(&id) {
                    kids.sort();
                    queue.extend(kids.iter().map(|(_, kid)| *kid));
                }
            }
            Ok(out)
        })
    }

    /// Append a snapshot of the current plan state
    pub fn snapshot(&self, plan_id: i64, note: Option<&str>) -> StoreResult<i64> {
        debug!(plan_id, ?note, "snapshot: called");
        self.with_plan(plan_id, |conn| {
            let tree = read_tree(conn, plan_id)?;
            insert_snapshot(conn, note, &tree)
        })
    }

    /// Stored snapshots, newest first
    pub fn list_snapshots(&self, plan_id: i64) -> StoreResult<Vec<SnapshotRecord>> {
        debug!(plan_id, "list_snapshots: called");
        self.with_plan(plan_id, |conn| {
            let mut stmt =
                conn.prepare("SELECT id, created_at, note, payload FROM plan_snapshots ORDER BY id DESC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SnapshotRecord {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        note: row.get(2)?,
                        tree: json_column(row, 3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

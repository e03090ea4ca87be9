//! Run order computation
//!
//! A node runs after its dependency targets and its children. The walk uses
//! an explicit stack so deep plans cannot overflow, and a visiting set so a
//! cycle fails fast instead of looping.

use std::collections::HashSet;

use planstore::PlanTree;
use tracing::{debug, warn};

use super::SchedulerError;

struct Frame {
    id: i64,
    prerequisites: Vec<i64>,
    next: usize,
}

impl Frame {
    fn new(tree: &PlanTree, id: i64) -> Self {
        let mut prerequisites: Vec<i64> = tree
            .get(id)
            .map(|n| n.dependencies.iter().copied().collect())
            .unwrap_or_default();
        prerequisites.extend_from_slice(tree.children(id));
        Self {
            id,
            prerequisites,
            next: 0,
        }
    }
}

struct Walk<'a> {
    tree: &'a PlanTree,
    done: HashSet<i64>,
    order: Vec<i64>,
}

impl Walk<'_> {
    fn visit(&mut self, start: i64) -> Result<(), SchedulerError> {
        if self.done.contains(&start) {
            return Ok(());
        }

        let mut stack = vec![Frame::new(self.tree, start)];
        let mut visiting = HashSet::from([start]);

        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.prerequisites.len() {
                let next = frame.prerequisites[frame.next];
                frame.next += 1;

                if self.done.contains(&next) {
                    continue;
                }
                if !self.tree.contains(next) {
                    warn!(task_id = frame.id, missing = next, "compute_run_order: ignoring missing prerequisite");
                    continue;
                }
                if visiting.contains(&next) {
                    let from = stack.iter().position(|f| f.id == next).unwrap_or(0);
                    let mut cycle: Vec<i64> = stack[from..].iter().map(|f| f.id).collect();
                    cycle.push(next);
                    return Err(SchedulerError::CycleDetected {
                        plan_id: self.tree.id,
                        cycle,
                    });
                }
                visiting.insert(next);
                stack.push(Frame::new(self.tree, next));
            } else if let Some(frame) = stack.pop() {
                visiting.remove(&frame.id);
                self.done.insert(frame.id);
                self.order.push(frame.id);
            }
        }
        Ok(())
    }
}

/// Leaf-and-dependency-first order over every node in the plan
///
/// Nodes unreachable from the roots (their parent is missing) are appended
/// after the regular pass.
pub fn compute_run_order(tree: &PlanTree) -> Result<Vec<i64>, SchedulerError> {
    debug!(plan_id = tree.id, nodes = tree.len(), "compute_run_order: called");
    let mut walk = Walk {
        tree,
        done: HashSet::with_capacity(tree.len()),
        order: Vec::with_capacity(tree.len()),
    };

    for root in tree.roots() {
        walk.visit(*root)?;
    }

    let regular = walk.order.len();
    for id in tree.nodes.keys() {
        walk.visit(*id)?;
    }
    if walk.order.len() > regular {
        debug!(orphans = walk.order.len() - regular, "compute_run_order: scheduled orphan nodes");
    }

    Ok(walk.order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use planstore::PlanNode;
    use serde_json::Map;

    fn node(id: i64, parent: Option<i64>, position: i64, deps: &[i64]) -> PlanNode {
        let mut n = PlanNode::new(1, id, format!("n{}", id), parent);
        n.position = position;
        n.dependencies = deps.iter().copied().collect();
        n
    }

    fn tree(nodes: Vec<PlanNode>) -> PlanTree {
        let mut tree = PlanTree::new(1, "t", None, Map::new());
        for n in nodes {
            tree.insert(n);
        }
        tree.rebuild_adjacency();
        tree
    }

    fn index(order: &[i64], id: i64) -> usize {
        order.iter().position(|x| *x == id).unwrap()
    }

    #[test]
    fn test_children_before_parent() {
        let tree = tree(vec![node(1, None, 0, &[]), node(2, Some(1), 0, &[]), node(3, Some(1), 1, &[])]);
        assert_eq!(compute_run_order(&tree).unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn test_dependencies_before_dependents() {
        // 2 depends on its later sibling 3
        let tree = tree(vec![
            node(1, None, 0, &[]),
            node(2, Some(1), 0, &[3]),
            node(3, Some(1), 1, &[]),
            node(4, Some(3), 0, &[]),
        ]);
        let order = compute_run_order(&tree).unwrap();
        assert_eq!(order.len(), 4);
        assert!(index(&order, 4) < index(&order, 3));
        assert!(index(&order, 3) < index(&order, 2));
        assert_eq!(*order.last().unwrap(), 1);
    }

    #[test]
    fn test_cross_root_dependency() {
        let tree = tree(vec![node(1, None, 0, &[2]), node(2, None, 1, &[])]);
        assert_eq!(compute_run_order(&tree).unwrap(), vec![2, 1]);
    }

    #[test]
    fn test_cycle_detected() {
        let tree = tree(vec![node(1, None, 0, &[2]), node(2, None, 1, &[1])]);
        let err = compute_run_order(&tree).unwrap_err();
        match err {
            SchedulerError::CycleDetected { plan_id, cycle } => {
                assert_eq!(plan_id, 1);
                assert_eq!(cycle, vec![1, 2, 1]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ancestor_dependency_is_a_cycle() {
        let tree = tree(vec![node(1, None, 0, &[]), node(2, Some(1), 0, &[1])]);
        assert!(matches!(
            compute_run_order(&tree),
            Err(SchedulerError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_orphans_appended() {
        // 5's parent 9 does not exist
        let tree = tree(vec![node(1, None, 0, &[]), node(5, Some(9), 0, &[])]);
        assert_eq!(compute_run_order(&tree).unwrap(), vec![1, 5]);
    }

    #[test]
    fn test_missing_dependency_ignored() {
        let tree = tree(vec![node(1, None, 0, &[42])]);
        assert_eq!(compute_run_order(&tree).unwrap(), vec![1]);
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let mut nodes = vec![node(1, None, 0, &[])];
        for id in 2..=20_000 {
            nodes.push(node(id, Some(id - 1), 0, &[]));
        }
        let order = compute_run_order(&tree(nodes)).unwrap();
        assert_eq!(order.first(), Some(&20_000));
        assert_eq!(order.last(), Some(&1));
    }
}

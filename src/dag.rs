//! Generic labelled directed graph used by the dependency resolver.
//!
//! `Dag<Id, T>` is deliberately not specialised to tasks: the only thing
//! the rest of the crate needs from it is "insert/remove nodes and
//! edges, detect cycles, topologically layer into parallel levels,
//! compute a critical path", so it is kept generic over both the node
//! identifier and its payload.
//!
//! An edge `add_edge(from, to)` means `from` must complete before `to`
//! can start: `from` is a dependency of `to`. `to`'s level is therefore
//! always strictly greater than `from`'s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use crate::error::DagError;

/// Trait alias bound satisfied by every identifier this graph is keyed
/// on (`TaskId`, or any future caller-supplied id type).
pub trait NodeId: Clone + Eq + Hash + Ord + std::fmt::Debug {}
impl<T: Clone + Eq + Hash + Ord + std::fmt::Debug> NodeId for T {}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

#[derive(Debug, Clone)]
pub struct Dag<Id: NodeId, T> {
    order: Vec<Id>,
    data: HashMap<Id, T>,
    // id -> nodes that depend on it (outgoing edges)
    dependents: HashMap<Id, Vec<Id>>,
    // id -> nodes it depends on (incoming edges)
    dependencies: HashMap<Id, Vec<Id>>,
}

impl<Id: NodeId, T> Default for Dag<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: NodeId, T> Dag<Id, T> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            data: HashMap::new(),
            dependents: HashMap::new(),
            dependencies: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.data.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &Id> {
        self.order.iter()
    }

    pub fn get(&self, id: &Id) -> Option<&T> {
        self.data.get(id)
    }

    pub fn add_node(&mut self, id: Id, data: T) -> Result<(), DagError<Id>> {
        if self.data.contains_key(&id) {
            return Err(DagError::DuplicateId(id));
        }
        self.order.push(id.clone());
        self.dependents.entry(id.clone()).or_default();
        self.dependencies.entry(id.clone()).or_default();
        self.data.insert(id, data);
        Ok(())
    }

    pub fn add_edge(&mut self, from: Id, to: Id) -> Result<(), DagError<Id>> {
        if !self.data.contains_key(&from) {
            return Err(DagError::MissingNode(from));
        }
        if !self.data.contains_key(&to) {
            return Err(DagError::MissingNode(to));
        }
        self.dependents.entry(from.clone()).or_default().push(to.clone());
        self.dependencies.entry(to).or_default().push(from);
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &Id, to: &Id) -> bool {
        let mut removed = false;
        if let Some(list) = self.dependents.get_mut(from) {
            let before = list.len();
            list.retain(|id| id != to);
            removed |= list.len() != before;
        }
        if let Some(list) = self.dependencies.get_mut(to) {
            list.retain(|id| id != from);
        }
        removed
    }

    pub fn remove_node(&mut self, id: &Id) -> bool {
        if !self.data.remove(id).is_some() {
            return false;
        }
        self.order.retain(|n| n != id);
        let dependents = self.dependents.remove(id).unwrap_or_default();
        let dependencies = self.dependencies.remove(id).unwrap_or_default();
        for dependent in &dependents {
            if let Some(list) = self.dependencies.get_mut(dependent) {
                list.retain(|n| n != id);
            }
        }
        for dependency in &dependencies {
            if let Some(list) = self.dependents.get_mut(dependency) {
                list.retain(|n| n != id);
            }
        }
        true
    }

    /// Direct dependencies of `id` (nodes that must run before it).
    pub fn dependencies(&self, id: &Id) -> Vec<Id> {
        self.dependencies.get(id).cloned().unwrap_or_default()
    }

    /// Direct dependents of `id` (nodes that run after it).
    pub fn dependents(&self, id: &Id) -> Vec<Id> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    pub fn transitive_dependencies(&self, id: &Id) -> HashSet<Id> {
        self.transitive(id, &self.dependencies)
    }

    pub fn transitive_dependents(&self, id: &Id) -> HashSet<Id> {
        self.transitive(id, &self.dependents)
    }

    fn transitive(&self, id: &Id, edges: &HashMap<Id, Vec<Id>>) -> HashSet<Id> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Id> = edges.get(id).cloned().unwrap_or_default().into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                if let Some(more) = edges.get(&next) {
                    queue.extend(more.iter().cloned());
                }
            }
        }
        seen
    }

    /// Returns the first cycle found, as an ordered id list starting and
    /// ending at the same node, or `None` if the graph is acyclic.
    /// Nodes are visited in insertion order for determinism.
    pub fn detect_cycle(&self) -> Option<Vec<Id>> {
        let mut marks: HashMap<Id, Mark> = HashMap::new();
        let mut path: Vec<Id> = Vec::new();

        for start in &self.order {
            if marks.contains_key(start) {
                continue;
            }
            if let Some(cycle) = self.dfs_find_cycle(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_find_cycle(
        &self,
        node: &Id,
        marks: &mut HashMap<Id, Mark>,
        path: &mut Vec<Id>,
    ) -> Option<Vec<Id>>
    where
        Id: std::fmt::Debug,
    {
        marks.insert(node.clone(), Mark::Visiting);
        path.push(node.clone());

        for next in self.dependents.get(node).cloned().unwrap_or_default() {
            match marks.get(&next) {
                Some(Mark::Done) => continue,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|id| *id == next).unwrap_or(0);
                    let mut cycle: Vec<Id> = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                None => {
                    if let Some(cycle) = self.dfs_find_cycle(&next, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(node.clone(), Mark::Done);
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.detect_cycle().is_some()
    }

    /// Kahn's algorithm. Fails with [`DagError::Cycle`] if a cycle
    /// exists; the reported cycle is the first one found by
    /// insertion-ordered DFS.
    pub fn topological_sort(&self) -> Result<Vec<Id>, DagError<Id>> {
        let levels = self.execution_levels()?;
        Ok(levels.into_iter().flatten().collect())
    }

    /// Layers the graph with Kahn's algorithm: level 0 is nodes with
    /// in-degree 0; level k+1 is nodes whose dependencies all lie in
    /// levels `<= k`. Deterministic with respect to insertion order
    /// within a level.
    pub fn execution_levels(&self) -> Result<Vec<Vec<Id>>, DagError<Id>> {
        let mut in_degree: HashMap<Id, usize> = HashMap::new();
        for id in &self.order {
            in_degree.insert(id.clone(), self.dependencies.get(id).map(|d| d.len()).unwrap_or(0));
        }

        let mut levels: Vec<Vec<Id>> = Vec::new();
        let mut remaining = self.order.len();
        let mut current: Vec<Id> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();

        while !current.is_empty() {
            remaining -= current.len();
            let mut next_in_degree = in_degree.clone();
            for id in &current {
                for dependent in self.dependents.get(id).cloned().unwrap_or_default() {
                    if let Some(count) = next_in_degree.get_mut(&dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            levels.push(current.clone());
            in_degree = next_in_degree;
            current = self
                .order
                .iter()
                .filter(|id| {
                    in_degree.get(*id).copied().unwrap_or(0) == 0
                        && !levels.iter().any(|lvl| lvl.contains(id))
                })
                .cloned()
                .collect();
        }

        if remaining != 0 {
            let cycle = self.detect_cycle().unwrap_or_default();
            return Err(DagError::Cycle(cycle));
        }

        Ok(levels)
    }

    /// Longest root-to-leaf path by node count. Ties are broken by
    /// insertion order (the earliest-inserted candidate wins).
    pub fn critical_path(&self) -> Vec<Id> {
        let levels = match self.execution_levels() {
            Ok(levels) => levels,
            Err(_) => return Vec::new(),
        };
        let topo: Vec<Id> = levels.into_iter().flatten().collect();

        let mut length: HashMap<Id, usize> = HashMap::new();
        let mut predecessor: HashMap<Id, Option<Id>> = HashMap::new();

        for id in &topo {
            let deps = self.dependencies.get(id).cloned().unwrap_or_default();
            if deps.is_empty() {
                length.insert(id.clone(), 1);
                predecessor.insert(id.clone(), None);
                continue;
            }
            let mut best_len = 0usize;
            let mut best_pred: Option<Id> = None;
            for dep in &deps {
                let dep_len = length.get(dep).copied().unwrap_or(1);
                if dep_len > best_len {
                    best_len = dep_len;
                    best_pred = Some(dep.clone());
                }
            }
            length.insert(id.clone(), best_len + 1);
            predecessor.insert(id.clone(), best_pred);
        }

        let mut best_id: Option<Id> = None;
        let mut best_len = 0usize;
        for id in &self.order {
            let len = length.get(id).copied().unwrap_or(0);
            if len > best_len {
                best_len = len;
                best_id = Some(id.clone());
            }
        }

        let mut path = Vec::new();
        let mut cursor = best_id;
        while let Some(id) = cursor {
            cursor = predecessor.get(&id).cloned().flatten();
            path.push(id);
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_diamond() -> Dag<String, ()> {
        let mut dag = Dag::new();
        for id in ["A", "B", "C", "D"] {
            dag.add_node(id.to_string(), ()).unwrap();
        }
        dag.add_edge("A".into(), "B".into()).unwrap();
        dag.add_edge("A".into(), "C".into()).unwrap();
        dag.add_edge("B".into(), "D".into()).unwrap();
        dag.add_edge("C".into(), "D".into()).unwrap();
        dag
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut dag: Dag<String, ()> = Dag::new();
        dag.add_node("A".into(), ()).unwrap();
        assert!(matches!(dag.add_node("A".into(), ()), Err(DagError::DuplicateId(_))));
    }

    #[test]
    fn edge_to_missing_node_rejected() {
        let mut dag: Dag<String, ()> = Dag::new();
        dag.add_node("A".into(), ()).unwrap();
        assert!(matches!(dag.add_edge("A".into(), "B".into()), Err(DagError::MissingNode(_))));
    }

    #[test]
    fn diamond_layers_correctly() {
        let dag = build_diamond();
        let levels = dag.execution_levels().unwrap();
        let as_vecs: Vec<Vec<String>> = levels;
        assert_eq!(as_vecs, vec![vec!["A".to_string()], vec!["B".to_string(), "C".to_string()], vec!["D".to_string()]]);
    }

    #[test]
    fn critical_path_length_for_diamond() {
        let dag = build_diamond();
        assert_eq!(dag.critical_path().len(), 3);
    }

    #[test]
    fn cycle_is_detected_and_reported() {
        let mut dag: Dag<String, ()> = Dag::new();
        for id in ["A", "B", "C"] {
            dag.add_node(id.to_string(), ()).unwrap();
        }
        dag.add_edge("A".into(), "B".into()).unwrap();
        dag.add_edge("B".into(), "C".into()).unwrap();
        dag.add_edge("C".into(), "A".into()).unwrap();

        assert!(dag.has_cycle());
        let cycle = dag.detect_cycle().unwrap();
        assert!(cycle.len() >= 3);

        assert!(matches!(dag.execution_levels(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn clone_preserves_levels() {
        let dag = build_diamond();
        let cloned = dag.clone();
        assert_eq!(dag.execution_levels().unwrap(), cloned.execution_levels().unwrap());
    }

    #[test]
    fn remove_node_drops_dangling_edges() {
        let mut dag = build_diamond();
        dag.remove_node(&"B".to_string());
        assert!(dag.dependents(&"A".to_string()) == vec!["C".to_string()]);
        assert!(dag.dependencies(&"D".to_string()) == vec!["C".to_string()]);
    }
}

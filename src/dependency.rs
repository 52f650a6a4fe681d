//! Dependency graph for derived values.
//!
//! An edge `A -> D` records that `D` was computed while reading `A`, so
//! writing `A` must invalidate `D`. Popping is destructive: every key
//! reached by a pop loses its outgoing edges, and recomputing a derived value
//! rebuilds them.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::key::StorageKey;

/// Directed graph `dependency -> {dependents}`.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    dependents: HashMap<StorageKey, HashSet<StorageKey>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that writing `dependency` invalidates `invalidates`.
    ///
    /// Idempotent. Self-edges are ignored.
    pub fn add_dependency(&mut self, dependency: StorageKey, invalidates: StorageKey) {
        if dependency == invalidates {
            return;
        }
        trace!(%dependency, %invalidates, "dependency edge");
        self.dependents.entry(dependency).or_default().insert(invalidates);
    }

    /// Remove and return the transitive closure of `of`, including `of`.
    ///
    /// Traversal is breadth first and never re-enqueues a visited key, so it
    /// terminates on cycles. Every visited key's outgoing edges are deleted.
    pub fn pop_dependencies(&mut self, of: &StorageKey) -> HashSet<StorageKey> {
        let mut visited = HashSet::new();
        self.pop_into(of, &mut visited);
        visited
    }

    /// Union of `pop_dependencies` over all `keys`.
    pub fn pop_all<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a StorageKey>,
    ) -> HashSet<StorageKey> {
        let mut visited = HashSet::new();
        for key in keys {
            self.pop_into(key, &mut visited);
        }
        visited
    }

    fn pop_into(&mut self, root: &StorageKey, visited: &mut HashSet<StorageKey>) {
        if !visited.insert(root.clone()) {
            return;
        }
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(key) = queue.pop_front() {
            let Some(dependents) = self.dependents.remove(&key) else {
                continue;
            };
            for dependent in dependents {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    /// Direct dependents of `of`, without modifying the graph.
    #[must_use]
    pub fn dependents(&self, of: &StorageKey) -> HashSet<StorageKey> {
        self.dependents.get(of).cloned().unwrap_or_default()
    }

    /// Total number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(HashSet::len).sum()
    }

    /// Returns true if the graph has no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// Remove every edge.
    pub fn clear(&mut self) {
        self.dependents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::uri(name)
    }

    fn set(names: &[&str]) -> HashSet<StorageKey> {
        names.iter().map(|n| key(n)).collect()
    }

    #[test]
    fn isolated_key_pops_as_singleton() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("x"), key("y"));
        assert_eq!(graph.pop_dependencies(&key("a")), set(&["a"]));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn add_dependency_is_idempotent() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("a"), key("b"));
        graph.add_dependency(key("a"), key("b"));
        graph.add_dependency(key("a"), key("a"));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.dependents(&key("a")), set(&["b"]));
    }

    #[test]
    fn cyclic_closure_terminates_and_prunes() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("A"), key("B"));
        graph.add_dependency(key("B"), key("C"));
        graph.add_dependency(key("C"), key("A"));
        graph.add_dependency(key("C"), key("F"));

        assert_eq!(graph.pop_dependencies(&key("A")), set(&["A", "B", "C", "F"]));
        assert!(graph.is_empty());
        assert_eq!(graph.pop_dependencies(&key("A")), set(&["A"]));
    }

    #[test]
    fn pop_leaves_unrelated_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("a"), key("derived"));
        graph.add_dependency(key("b"), key("derived"));
        graph.add_dependency(key("x"), key("y"));

        assert_eq!(graph.pop_dependencies(&key("a")), set(&["a", "derived"]));
        // `b -> derived` survives until `derived` is recomputed or `b` is popped.
        assert_eq!(graph.dependents(&key("b")), set(&["derived"]));
        assert_eq!(graph.dependents(&key("x")), set(&["y"]));
    }

    #[test]
    fn diamond_visits_each_key_once() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("root"), key("l"));
        graph.add_dependency(key("root"), key("r"));
        graph.add_dependency(key("l"), key("sink"));
        graph.add_dependency(key("r"), key("sink"));
        graph.add_dependency(key("sink"), key("tail"));

        assert_eq!(
            graph.pop_dependencies(&key("root")),
            set(&["root", "l", "r", "sink", "tail"])
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn pop_all_unions_roots() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(key("a"), key("a2"));
        graph.add_dependency(key("b"), key("b2"));
        let popped = graph.pop_all([&key("a"), &key("b"), &key("a")]);
        assert_eq!(popped, set(&["a", "a2", "b", "b2"]));
        assert!(graph.is_empty());
    }
}

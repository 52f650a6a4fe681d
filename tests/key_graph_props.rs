use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use proptest::prelude::*;

use statecraft::{DependencyGraph, StorageKey};

struct Node;

fn hash_of(key: &StorageKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn node(id: u8) -> StorageKey {
    StorageKey::with_discriminators::<Node, _>([u64::from(id)])
}

/// Reachability from `start` over `edges`, including `start`.
fn reachable(edges: &[(u8, u8)], start: u8) -> HashSet<u8> {
    let mut adjacency: HashMap<u8, Vec<u8>> = HashMap::new();
    for &(from, to) in edges {
        if from != to {
            adjacency.entry(from).or_default().push(to);
        }
    }
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for &next in adjacency.get(&current).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

proptest! {
    #[test]
    fn equal_discriminators_give_equal_keys(
        values in proptest::collection::vec(any::<i64>(), 0..6),
    ) {
        let a = StorageKey::with_discriminators::<Node, _>(values.clone());
        let b = StorageKey::with_discriminators::<Node, _>(values);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_discriminators_give_different_keys(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        prop_assert_ne!(
            StorageKey::with_discriminators::<Node, _>([a]),
            StorageKey::with_discriminators::<Node, _>([b])
        );
    }

    #[test]
    fn uri_keys_compare_by_text(path in "[a-z]{1,8}(/[a-z0-9]{1,8}){0,3}") {
        prop_assert_eq!(StorageKey::uri(path.clone()), StorageKey::uri(path.clone()));
        prop_assert_ne!(StorageKey::uri(path.clone()), StorageKey::uri(format!("{path}/x")));
    }

    #[test]
    fn pop_returns_reachable_closure_then_prunes(
        edges in proptest::collection::vec((0u8..12, 0u8..12), 0..40),
        start in 0u8..12,
    ) {
        let mut graph = DependencyGraph::new();
        for &(from, to) in &edges {
            graph.add_dependency(node(from), node(to));
        }

        let expected: HashSet<StorageKey> =
            reachable(&edges, start).into_iter().map(node).collect();
        prop_assert_eq!(graph.pop_dependencies(&node(start)), expected.clone());

        // Every popped key lost its outgoing edges.
        for key in &expected {
            prop_assert!(graph.dependents(key).is_empty());
        }
        prop_assert_eq!(graph.pop_dependencies(&node(start)), HashSet::from([node(start)]));
    }
}

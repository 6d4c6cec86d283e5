// src/services/episode.rs
//! Orders the steps of an episode from their `previous_id` links.
//!
//! Nodes form a forest. Each parent gets its own priority layer of children;
//! layers are walked depth-first with an explicit stack, so a node is always
//! emitted before anything that follows it. Between unrelated nodes the
//! larger `(key, id)` comes first.

use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedSteps {
    pub order: Vec<String>,
    /// Steps unreachable from any root: cycle members and their descendants.
    pub unreachable: Vec<String>,
}

#[derive(Debug)]
pub struct TopoSorter<K: Ord> {
    nodes: HashMap<String, (K, Option<String>)>,
}

impl<K: Ord> Default for TopoSorter<K> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }
}

impl<K: Ord + Clone> TopoSorter<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node. A repeated id keeps its first registration.
    pub fn push(&mut self, id: impl Into<String>, key: K, previous_id: Option<String>) -> bool {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, (key, previous_id));
        true
    }

    pub fn sort(self) -> SortedSteps {
        let mut roots: BinaryHeap<(K, String)> = BinaryHeap::new();
        let mut next: HashMap<String, BinaryHeap<(K, String)>> = HashMap::new();

        for (id, (key, previous)) in &self.nodes {
            match previous {
                Some(prev) if prev != id && self.nodes.contains_key(prev) => {
                    next.entry(prev.clone())
                        .or_default()
                        .push((key.clone(), id.clone()));
                }
                Some(prev) if prev == id => {
                    // self-loop: never reachable
                }
                Some(prev) => {
                    tracing::warn!(
                        step_id = id.as_str(),
                        previous_id = prev.as_str(),
                        "previous step is not in this batch, treating step as a root"
                    );
                    roots.push((key.clone(), id.clone()));
                }
                None => roots.push((key.clone(), id.clone())),
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut layers = vec![roots];
        while let Some(top) = layers.last_mut() {
            match top.pop() {
                Some((_, id)) => {
                    let children = next.remove(&id);
                    order.push(id);
                    if let Some(children) = children {
                        layers.push(children);
                    }
                }
                None => {
                    layers.pop();
                }
            }
        }

        let mut unreachable: Vec<String> = next
            .into_values()
            .flat_map(|heap| heap.into_vec().into_iter().map(|(_, id)| id))
            .collect();
        for (id, (_, previous)) in &self.nodes {
            if previous.as_deref() == Some(id.as_str()) {
                unreachable.push(id.clone());
            }
        }
        unreachable.sort();
        SortedSteps { order, unreachable }
    }
}

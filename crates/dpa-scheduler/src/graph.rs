//! In-memory graph of configuration items and their relations.
//!
//! Nodes are keyed by [`Key`]; edges express "depends-on" (explicit reverse
//! index for plain-key targets, prefix scan for any-of targets) and
//! "derived-from" (parent/child key lists on the nodes). The graph is
//! mutated only by the transaction executor.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use dpa_model::{ConfigValue, Key, Metadata};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};

use crate::descriptor::{DepTarget, Dependency, ValueOrigin};
use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueState {
    /// Declared but not applied; at least one dependency is unsatisfied, or
    /// no attempt has been made yet.
    #[default]
    Pending,
    /// A backend operation for the value is in flight.
    Configuring,
    /// Applied in the backend (or discovered there).
    Configured,
    /// The last backend operation or validation failed.
    Failed,
    /// The value was removed; transient, visible only in transaction records.
    Removed,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub key: Key,
    /// Desired (northbound) or discovered (southbound) value.
    pub value: Option<ConfigValue>,
    /// Value most recently applied in the backend; differs from `value`
    /// while an update is pending or failed.
    pub applied: Option<ConfigValue>,
    pub origin: ValueOrigin,
    pub state: ValueState,
    pub metadata: Option<Metadata>,
    /// Owning descriptor; `None` for unimplemented or property-only keys.
    pub descriptor: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub derived_from: Option<Key>,
    pub derived: Vec<Key>,
    /// Message of the last failure, kept until the next successful apply.
    pub error: Option<String>,
    /// Sequence number of the transaction that last wrote the desired value;
    /// used to drop obsolete retries.
    pub revision: u64,
    /// The desired state is absence, but the last delete attempt failed.
    pub pending_removal: bool,
}

impl Node {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            value: None,
            applied: None,
            origin: ValueOrigin::Northbound,
            state: ValueState::Pending,
            metadata: None,
            descriptor: None,
            dependencies: Vec::new(),
            derived_from: None,
            derived: Vec::new(),
            error: None,
            revision: 0,
            pending_removal: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.state == ValueState::Configured && !self.pending_removal
    }
}

#[derive(Default)]
pub struct Graph {
    nodes: BTreeMap<Key, Node>,
    /// Reverse plain-key dependency edges: target key -> dependent keys.
    dependents: BTreeMap<Key, BTreeSet<Key>>,
    /// Keys of nodes with at least one any-of dependency; candidates are
    /// found by prefix scan instead of the reverse index.
    anyof_watchers: BTreeSet<Key>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, key: &Key) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Base values only (no derived entries).
    pub fn base_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.derived_from.is_none())
    }

    pub fn pending_keys(&self) -> Vec<Key> {
        self.nodes
            .values()
            .filter(|n| n.state == ValueState::Pending)
            .map(|n| n.key.clone())
            .collect()
    }

    pub(crate) fn node_mut(&mut self, key: &Key) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    /// Inserts or replaces a node and refreshes its outgoing dependency
    /// edges.
    pub(crate) fn upsert(&mut self, node: Node) {
        self.unlink_dependent(&node.key);
        for dep in &node.dependencies {
            match &dep.target {
                DepTarget::Key(target) => {
                    self.dependents
                        .entry(target.clone())
                        .or_default()
                        .insert(node.key.clone());
                }
                DepTarget::AnyOf { .. } => {
                    self.anyof_watchers.insert(node.key.clone());
                }
            }
        }
        self.nodes.insert(node.key.clone(), node);
    }

    pub(crate) fn remove(&mut self, key: &Key) -> Option<Node> {
        self.unlink_dependent(key);
        self.nodes.remove(key)
    }

    fn unlink_dependent(&mut self, key: &Key) {
        let Some(existing) = self.nodes.get(key) else {
            return;
        };
        for dep in &existing.dependencies {
            if let DepTarget::Key(target) = &dep.target {
                if let Some(set) = self.dependents.get_mut(target) {
                    set.remove(key);
                    if set.is_empty() {
                        self.dependents.remove(target);
                    }
                }
            }
        }
        self.anyof_watchers.remove(key);
    }

    /// A plain-key dependency is satisfied iff the target node is
    /// configured; an any-of dependency iff at least one configured key
    /// matches.
    pub fn dependency_satisfied(&self, dep: &Dependency) -> bool {
        match &dep.target {
            DepTarget::Key(target) => {
                self.nodes.get(target).is_some_and(Node::is_configured)
            }
            DepTarget::AnyOf { prefixes, .. } => prefixes.iter().any(|prefix| {
                self.keys_with_prefix(prefix)
                    .any(|node| dep.matches(&node.key) && node.is_configured())
            }),
        }
    }

    pub fn satisfied_dependencies(&self, deps: &[Dependency]) -> bool {
        deps.iter().all(|dep| self.dependency_satisfied(dep))
    }

    fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.has_prefix(prefix))
            .map(|(_, node)| node)
    }

    /// Keys whose dependency set references `key` (as exact target or as an
    /// any-of candidate).
    pub fn dependents_of(&self, key: &Key) -> Vec<Key> {
        let mut result: BTreeSet<Key> = self
            .dependents
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for watcher in &self.anyof_watchers {
            if result.contains(watcher) {
                continue;
            }
            let Some(node) = self.nodes.get(watcher) else {
                continue;
            };
            if node.dependencies.iter().any(|dep| {
                matches!(dep.target, DepTarget::AnyOf { .. }) && dep.matches(key)
            }) {
                result.insert(watcher.clone());
            }
        }
        result.remove(key);
        result.into_iter().collect()
    }
}

/// Topological order of `keys` such that every dependency comes before its
/// dependents. `deps_of` supplies the (possibly staged, not yet inserted)
/// dependency list of each key. A cycle is a fatal configuration error,
/// reported with its member keys.
pub(crate) fn topological_order<F>(
    keys: &BTreeSet<Key>,
    deps_of: F,
) -> Result<Vec<Key>, SchedulerError>
where
    F: Fn(&Key) -> Vec<Dependency>,
{
    let deps: Vec<(Key, Vec<Dependency>)> = keys
        .iter()
        .map(|key| (key.clone(), deps_of(key)))
        .collect();
    let mut graph = DiGraphMap::<&str, ()>::new();
    for key in keys {
        graph.add_node(key.as_str());
    }
    for (key, dependencies) in &deps {
        for dep in dependencies {
            match &dep.target {
                DepTarget::Key(target) => {
                    if let Some(target) = keys.get(target) {
                        graph.add_edge(target.as_str(), key.as_str(), ());
                    }
                }
                DepTarget::AnyOf { .. } => {
                    for candidate in keys {
                        if candidate != key && dep.matches(candidate) {
                            graph.add_edge(candidate.as_str(), key.as_str(), ());
                        }
                    }
                }
            }
        }
    }
    match toposort(&graph, None) {
        Ok(order) => Ok(order
            .into_iter()
            .map(|key| keys.get(key).expect("node from key set").clone())
            .collect()),
        Err(_) => {
            let cycle: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .map(|scc| scc.into_iter().map(str::to_string).collect())
                .unwrap_or_default();
            Err(SchedulerError::DependencyCycle { keys: cycle })
        }
    }
}

use std::sync::Arc;

use dpa_model::Key;
use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::descriptor::KVDescriptor;
use crate::error::SchedulerError;

/// Holds every registered descriptor and answers key-ownership queries.
///
/// Registration order is preserved; [`resolve`](Self::resolve) walks
/// descriptors in that order, so with disjoint selectors (enforced by
/// sample-key probing) the owner is unique.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: IndexMap<String, Arc<dyn KVDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: Arc<dyn KVDescriptor>) -> Result<(), SchedulerError> {
        let name = descriptor.name().to_string();
        if self.descriptors.contains_key(&name) {
            return Err(SchedulerError::DuplicateDescriptor(name));
        }
        for (other_name, other) in &self.descriptors {
            if let Some(key) = selector_overlap(other.as_ref(), descriptor.as_ref()) {
                return Err(SchedulerError::SelectorOverlap {
                    first: other_name.clone(),
                    second: name,
                    key,
                });
            }
        }
        self.descriptors.insert(name, descriptor);
        Ok(())
    }

    /// Returns the unique owner of `key`, or `None` for keys that are only
    /// observed externally and never applied by this agent.
    pub fn resolve(&self, key: &Key) -> Option<&Arc<dyn KVDescriptor>> {
        self.descriptors
            .values()
            .find(|descriptor| descriptor.key_selector(key))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn KVDescriptor>> {
        self.descriptors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptor names ordered so that every descriptor comes after the
    /// descriptors it declares in `retrieve_dependencies`. The resync engine
    /// retrieves in this order.
    pub fn retrieve_order(&self) -> Result<Vec<String>, SchedulerError> {
        let mut graph = DiGraphMap::<&str, ()>::new();
        for name in self.descriptors.keys() {
            graph.add_node(name.as_str());
        }
        for (name, descriptor) in &self.descriptors {
            for dep in descriptor.retrieve_dependencies() {
                let Some((dep_name, _)) = self.descriptors.get_key_value(&dep) else {
                    return Err(SchedulerError::UnknownRetrieveDependency {
                        descriptor: name.clone(),
                        dependency: dep,
                    });
                };
                graph.add_edge(dep_name.as_str(), name.as_str(), ());
            }
        }
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
            Err(cycle) => Err(SchedulerError::RetrieveDependencyCycle(
                cycle.node_id().to_string(),
            )),
        }
    }
}

fn selector_overlap(a: &dyn KVDescriptor, b: &dyn KVDescriptor) -> Option<Key> {
    for key in b.sample_keys() {
        if a.key_selector(&key) {
            return Some(key);
        }
    }
    for key in a.sample_keys() {
        if b.key_selector(&key) {
            return Some(key);
        }
    }
    None
}

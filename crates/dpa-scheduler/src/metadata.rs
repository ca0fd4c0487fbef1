//! Per-descriptor metadata maps with optional secondary index.
//!
//! Metadata is written only on the executor path (Create/Update/Delete
//! outcomes); everyone else, most importantly other descriptors that need
//! e.g. a kernel-assigned interface index, reads through a cloned
//! [`MetadataBroker`] handle.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use dpa_model::{Key, Metadata};

/// key -> metadata for one descriptor, plus an optional u64 secondary index
/// (populated from [`KVDescriptor::metadata_index`](crate::KVDescriptor::metadata_index)).
#[derive(Debug, Default, Clone)]
pub struct MetadataMap {
    by_key: BTreeMap<Key, Metadata>,
    by_index: BTreeMap<u64, Key>,
}

impl MetadataMap {
    pub fn lookup(&self, key: &Key) -> Option<&Metadata> {
        self.by_key.get(key)
    }

    pub fn lookup_by_index(&self, index: u64) -> Option<(&Key, &Metadata)> {
        let key = self.by_index.get(&index)?;
        self.by_key.get(key).map(|meta| (key, meta))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.by_key.keys()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn insert(&mut self, key: Key, metadata: Metadata, index: Option<u64>) {
        self.remove(&key);
        if let Some(index) = index {
            self.by_index.insert(index, key.clone());
        }
        self.by_key.insert(key, metadata);
    }

    fn remove(&mut self, key: &Key) -> Option<Metadata> {
        let removed = self.by_key.remove(key)?;
        self.by_index.retain(|_, indexed| indexed != key);
        Some(removed)
    }
}

/// Shared, cheaply cloneable access point to every descriptor's metadata
/// map. Hand a clone to each descriptor at construction; reads are safe from
/// any thread, writes happen only inside the executor.
#[derive(Debug, Default, Clone)]
pub struct MetadataBroker {
    maps: Arc<RwLock<BTreeMap<String, MetadataMap>>>,
}

impl MetadataBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, descriptor: &str, key: &Key) -> Option<Metadata> {
        let maps = self.maps.read().unwrap();
        maps.get(descriptor)?.lookup(key).cloned()
    }

    pub fn lookup_by_index(&self, descriptor: &str, index: u64) -> Option<(Key, Metadata)> {
        let maps = self.maps.read().unwrap();
        maps.get(descriptor)?
            .lookup_by_index(index)
            .map(|(key, meta)| (key.clone(), meta.clone()))
    }

    /// Snapshot of one descriptor's whole map.
    pub fn map_snapshot(&self, descriptor: &str) -> Option<MetadataMap> {
        let maps = self.maps.read().unwrap();
        maps.get(descriptor).cloned()
    }

    pub(crate) fn store(
        &self,
        descriptor: &str,
        key: Key,
        metadata: Metadata,
        index: Option<u64>,
    ) {
        let mut maps = self.maps.write().unwrap();
        maps.entry(descriptor.to_string())
            .or_default()
            .insert(key, metadata, index);
    }

    pub(crate) fn clear(&self, descriptor: &str, key: &Key) -> Option<Metadata> {
        let mut maps = self.maps.write().unwrap();
        maps.get_mut(descriptor)?.remove(key)
    }
}

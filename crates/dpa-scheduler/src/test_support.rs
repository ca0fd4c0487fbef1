//! Mock descriptors and a simulated backend for tests.
//!
//! Scenario tests drive the scheduler against an in-memory "dataplane":
//! Create/Delete mutate a shared [`MockBackend`], Retrieve lists it, and a
//! shared [`CallLog`] records the exact order of descriptor invocations so
//! tests can assert dependency ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dpa_model::{ConfigValue, Interface, InterfaceKind, InterfaceMeta, Key, KeyValuePair, Metadata, Route};

use crate::descriptor::{Dependency, KVDescriptor, KVWithMetadata, ValueOrigin};
use crate::error::{DescriptorError, InvalidValueError};

/// Shared, ordered record of descriptor invocations, e.g.
/// `create:config/interface/tap0`.
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, op: &str, key: &Key) {
        self.entries.lock().unwrap().push(format!("{op}:{key}"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Returns and clears the recorded entries.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }

    /// Position of the first entry equal to `entry`, if any.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// In-memory stand-in for the southbound plane, shared between descriptors
/// and the test body.
#[derive(Debug, Default, Clone)]
pub struct MockBackend {
    items: Arc<Mutex<BTreeMap<Key, (ConfigValue, Option<Metadata>)>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.items.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Seeds a value as if it had been configured outside the agent.
    pub fn seed(&self, key: Key, value: ConfigValue, metadata: Option<Metadata>) {
        self.items.lock().unwrap().insert(key, (value, metadata));
    }

    /// Simulates the backend losing a value behind the agent's back.
    pub fn lose(&self, key: &Key) {
        self.items.lock().unwrap().remove(key);
    }

    fn insert(&self, key: Key, value: ConfigValue, metadata: Option<Metadata>) {
        self.items.lock().unwrap().insert(key, (value, metadata));
    }

    fn remove(&self, key: &Key) {
        self.items.lock().unwrap().remove(key);
    }

    fn list(&self, selector: impl Fn(&Key) -> bool) -> Vec<KVWithMetadata> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| selector(key))
            .map(|(key, (value, metadata))| KVWithMetadata {
                key: key.clone(),
                value: value.clone(),
                metadata: metadata.clone(),
                origin: ValueOrigin::Unknown,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureMode {
    remaining: u32,
    retriable: bool,
}

type DepsFn = dyn Fn(&Key, &ConfigValue) -> Vec<Dependency> + Send + Sync;
type DerivedFn = dyn Fn(&Key, &ConfigValue) -> Vec<KeyValuePair> + Send + Sync;
type ValidateFn = dyn Fn(&Key, &ConfigValue) -> Result<(), InvalidValueError> + Send + Sync;

/// Configurable prefix-owning descriptor backed by a [`MockBackend`].
pub struct MockDescriptor {
    name: String,
    prefix: String,
    log: CallLog,
    backend: MockBackend,
    with_metadata: bool,
    supports_retrieve: bool,
    cleanup_discovered: bool,
    recreate_on_update: bool,
    retrieve_deps: Vec<String>,
    deps_fn: Option<Box<DepsFn>>,
    derived_fn: Option<Box<DerivedFn>>,
    validate_fn: Option<Box<ValidateFn>>,
    create_failures: Mutex<HashMap<Key, FailureMode>>,
    delete_failures: Mutex<HashMap<Key, FailureMode>>,
    retrieve_failure: Mutex<Option<String>>,
    next_index: AtomicU64,
}

impl MockDescriptor {
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        log: CallLog,
        backend: MockBackend,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            log,
            backend,
            with_metadata: false,
            supports_retrieve: false,
            cleanup_discovered: false,
            recreate_on_update: false,
            retrieve_deps: Vec::new(),
            deps_fn: None,
            derived_fn: None,
            validate_fn: None,
            create_failures: Mutex::new(HashMap::new()),
            delete_failures: Mutex::new(HashMap::new()),
            retrieve_failure: Mutex::new(None),
            next_index: AtomicU64::new(1),
        }
    }

    pub fn with_metadata(mut self) -> Self {
        self.with_metadata = true;
        self
    }

    pub fn retrieving(mut self) -> Self {
        self.supports_retrieve = true;
        self
    }

    pub fn cleaning_up_discovered(mut self) -> Self {
        self.cleanup_discovered = true;
        self
    }

    pub fn recreate_on_update(mut self) -> Self {
        self.recreate_on_update = true;
        self
    }

    pub fn with_retrieve_deps(mut self, deps: &[&str]) -> Self {
        self.retrieve_deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_dependencies(
        mut self,
        f: impl Fn(&Key, &ConfigValue) -> Vec<Dependency> + Send + Sync + 'static,
    ) -> Self {
        self.deps_fn = Some(Box::new(f));
        self
    }

    pub fn with_derived(
        mut self,
        f: impl Fn(&Key, &ConfigValue) -> Vec<KeyValuePair> + Send + Sync + 'static,
    ) -> Self {
        self.derived_fn = Some(Box::new(f));
        self
    }

    pub fn with_validation(
        mut self,
        f: impl Fn(&Key, &ConfigValue) -> Result<(), InvalidValueError> + Send + Sync + 'static,
    ) -> Self {
        self.validate_fn = Some(Box::new(f));
        self
    }

    /// Makes the next `times` Create calls for `key` fail.
    pub fn fail_create(&self, key: Key, times: u32, retriable: bool) {
        self.create_failures.lock().unwrap().insert(
            key,
            FailureMode {
                remaining: times,
                retriable,
            },
        );
    }

    /// Makes the next `times` Delete calls for `key` fail.
    pub fn fail_delete(&self, key: Key, times: u32, retriable: bool) {
        self.delete_failures.lock().unwrap().insert(
            key,
            FailureMode {
                remaining: times,
                retriable,
            },
        );
    }

    /// Makes Retrieve fail until cleared.
    pub fn fail_retrieve(&self, message: impl Into<String>) {
        *self.retrieve_failure.lock().unwrap() = Some(message.into());
    }

    pub fn heal_retrieve(&self) {
        *self.retrieve_failure.lock().unwrap() = None;
    }

    fn take_failure(
        failures: &Mutex<HashMap<Key, FailureMode>>,
        key: &Key,
    ) -> Option<DescriptorError> {
        let mut failures = failures.lock().unwrap();
        let mode = failures.get_mut(key)?;
        if mode.remaining == 0 {
            failures.remove(key);
            return None;
        }
        mode.remaining -= 1;
        let kind = if mode.retriable { "transient" } else { "permanent" };
        Some(DescriptorError::message(format!(
            "{kind} backend failure injected for {key}"
        )))
    }
}

impl KVDescriptor for MockDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_selector(&self, key: &Key) -> bool {
        key.has_prefix(&self.prefix)
    }

    fn sample_keys(&self) -> Vec<Key> {
        vec![Key::new(format!("{}sample", self.prefix)).expect("valid sample key")]
    }

    fn validate(&self, key: &Key, value: &ConfigValue) -> Result<(), InvalidValueError> {
        match &self.validate_fn {
            Some(validate) => validate(key, value),
            None => Ok(()),
        }
    }

    fn create(&self, key: &Key, value: &ConfigValue) -> Result<Option<Metadata>, DescriptorError> {
        if let Some(err) = Self::take_failure(&self.create_failures, key) {
            return Err(err);
        }
        let metadata = self.with_metadata.then(|| {
            Metadata::Interface(InterfaceMeta {
                sw_if_index: self.next_index.fetch_add(1, Ordering::SeqCst) as u32,
                os_if_index: None,
                namespace: None,
            })
        });
        self.backend.insert(key.clone(), value.clone(), metadata.clone());
        self.log.push("create", key);
        Ok(metadata)
    }

    fn update(
        &self,
        key: &Key,
        _old: &ConfigValue,
        new: &ConfigValue,
        old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        let metadata = old_metadata.cloned();
        self.backend.insert(key.clone(), new.clone(), metadata.clone());
        self.log.push("update", key);
        Ok(metadata)
    }

    fn delete(
        &self,
        key: &Key,
        _value: &ConfigValue,
        _metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        if let Some(err) = Self::take_failure(&self.delete_failures, key) {
            return Err(err);
        }
        self.backend.remove(key);
        self.log.push("delete", key);
        Ok(())
    }

    fn update_with_recreate(
        &self,
        _key: &Key,
        _old: &ConfigValue,
        _new: &ConfigValue,
        _metadata: Option<&Metadata>,
    ) -> bool {
        self.recreate_on_update
    }

    fn supports_retrieve(&self) -> bool {
        self.supports_retrieve
    }

    fn retrieve(
        &self,
        _correlate: &[KVWithMetadata],
    ) -> Result<Vec<KVWithMetadata>, DescriptorError> {
        if let Some(message) = self.retrieve_failure.lock().unwrap().clone() {
            return Err(DescriptorError::message(message));
        }
        self.log.push("retrieve", &self.sample_keys()[0]);
        Ok(self.backend.list(|key| self.key_selector(key)))
    }

    fn dependencies(&self, key: &Key, value: &ConfigValue) -> Vec<Dependency> {
        match &self.deps_fn {
            Some(deps) => deps(key, value),
            None => Vec::new(),
        }
    }

    fn derived_values(&self, key: &Key, value: &ConfigValue) -> Vec<KeyValuePair> {
        match &self.derived_fn {
            Some(derived) => derived(key, value),
            None => Vec::new(),
        }
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        !err.to_string().contains("permanent")
    }

    fn with_metadata(&self) -> bool {
        self.with_metadata
    }

    fn metadata_index(&self, metadata: &Metadata) -> Option<u64> {
        match metadata {
            Metadata::Interface(meta) => Some(u64::from(meta.sw_if_index)),
            _ => None,
        }
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.retrieve_deps.clone()
    }

    fn cleanup_discovered(&self) -> bool {
        self.cleanup_discovered
    }
}

/// `config/interface/<name>` value for a tap interface.
pub fn tap_interface(name: &str) -> ConfigValue {
    ConfigValue::Interface(Interface {
        name: name.to_string(),
        kind: InterfaceKind::Tap,
        enabled: true,
        phys_address: None,
        ip_addresses: Vec::new(),
        mtu: None,
        namespace: None,
        host_if_name: None,
    })
}

/// `config/route/...` value routed out of `out_interface`.
pub fn route_via(out_interface: &str, dst_network: &str) -> ConfigValue {
    ConfigValue::Route(Route {
        dst_network: dst_network.to_string(),
        out_interface: out_interface.to_string(),
        gw_addr: None,
        metric: None,
        scope: Default::default(),
    })
}

//! The descriptor contract: everything the scheduler needs to know to manage
//! one class of configuration keys.

use std::fmt;

use dpa_model::{ConfigValue, Key, KeyValuePair, Metadata};
use serde::{Deserialize, Serialize};

use crate::error::{DescriptorError, InvalidValueError};

/// Provenance of a key-value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueOrigin {
    /// Explicitly declared by a northbound client.
    Northbound,
    /// Discovered in the southbound plane, not managed by this agent.
    Southbound,
    /// Retrieved without attribution; resolved by the scheduler against the
    /// declared state (correlated keys become `Northbound`, the rest
    /// `Southbound`).
    Unknown,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueOrigin::Northbound => "from-NB",
            ValueOrigin::Southbound => "from-SB",
            ValueOrigin::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Key-value pair enriched with descriptor metadata and origin, as exchanged
/// with `Retrieve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KVWithMetadata {
    pub key: Key,
    pub value: ConfigValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

/// Optional refinement of an any-of dependency beyond prefix matching.
pub type KeyPredicate = fn(&Key) -> bool;

/// What a dependency waits for.
#[derive(Debug, Clone)]
pub enum DepTarget {
    /// Satisfied once this exact key is configured.
    Key(Key),
    /// Satisfied once at least one configured key starts with one of the
    /// prefixes and passes the predicate, if any.
    AnyOf {
        prefixes: Vec<String>,
        predicate: Option<KeyPredicate>,
    },
}

/// A named precondition of a value: the value may only be applied while the
/// target is satisfied.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Short human-readable label, unique within one value's dependencies.
    pub label: String,
    pub target: DepTarget,
}

impl Dependency {
    pub fn on_key(label: impl Into<String>, key: Key) -> Self {
        Self {
            label: label.into(),
            target: DepTarget::Key(key),
        }
    }

    pub fn any_of(label: impl Into<String>, prefixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            label: label.into(),
            target: DepTarget::AnyOf {
                prefixes: prefixes.into_iter().collect(),
                predicate: None,
            },
        }
    }

    pub fn any_of_matching(
        label: impl Into<String>,
        prefixes: impl IntoIterator<Item = String>,
        predicate: KeyPredicate,
    ) -> Self {
        Self {
            label: label.into(),
            target: DepTarget::AnyOf {
                prefixes: prefixes.into_iter().collect(),
                predicate: Some(predicate),
            },
        }
    }

    /// Whether `key` is a candidate that can satisfy this dependency.
    pub fn matches(&self, key: &Key) -> bool {
        match &self.target {
            DepTarget::Key(dep_key) => dep_key == key,
            DepTarget::AnyOf {
                prefixes,
                predicate,
            } => {
                prefixes.iter().any(|p| key.has_prefix(p))
                    && predicate.map_or(true, |pred| pred(key))
            }
        }
    }
}

/// Teaches the scheduler how to validate, apply, and retrieve values under
/// the keys matched by [`key_selector`](Self::key_selector).
///
/// The scheduler does not care what the operations do against the backend; it
/// only calls the right ones at the right time, in dependency order. All
/// engine-owned state is communicated through arguments and return values;
/// descriptors must not reach into the graph or the metadata maps directly
/// (read-only metadata access goes through a
/// [`MetadataBroker`](crate::MetadataBroker) handle injected at
/// construction).
pub trait KVDescriptor: Send + Sync {
    /// Unique across all registered descriptors.
    fn name(&self) -> &str;

    /// Ownership test for a key.
    fn key_selector(&self, key: &Key) -> bool;

    /// Representative keys of this descriptor's key space, used only to probe
    /// for selector overlap at registration time.
    fn sample_keys(&self) -> Vec<Key>;

    /// Cheap, side-effect-free precondition check, called before every
    /// Create/Update. A failure is permanent: the value is marked invalid and
    /// never applied.
    fn validate(&self, _key: &Key, _value: &ConfigValue) -> Result<(), InvalidValueError> {
        Ok(())
    }

    /// Creates the value in the backend. May return metadata to associate
    /// with the value (only kept when [`with_metadata`](Self::with_metadata)
    /// is true).
    fn create(&self, key: &Key, value: &ConfigValue) -> Result<Option<Metadata>, DescriptorError>;

    /// Applies a value change in place. Descriptors without an in-place
    /// update return true from
    /// [`update_with_recreate`](Self::update_with_recreate) instead.
    fn update(
        &self,
        _key: &Key,
        _old: &ConfigValue,
        _new: &ConfigValue,
        _old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unsupported("update"))
    }

    /// Removes the value from the backend.
    fn delete(
        &self,
        key: &Key,
        value: &ConfigValue,
        metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError>;

    /// Declares that going from `old` to `new` cannot be applied in place and
    /// must be realized as Delete followed by Create.
    fn update_with_recreate(
        &self,
        _key: &Key,
        _old: &ConfigValue,
        _new: &ConfigValue,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// Whether [`retrieve`](Self::retrieve) is implemented. Descriptors that
    /// cannot read the backend keep the default; their keys are never
    /// refreshed during resync.
    fn supports_retrieve(&self) -> bool {
        false
    }

    /// Returns all base (non-derived) values that really exist in the
    /// backend. `correlate` carries the values the scheduler expects to
    /// exist; the descriptor may rewrite a retrieved value into the expected
    /// form when both describe the same backend object.
    fn retrieve(
        &self,
        _correlate: &[KVWithMetadata],
    ) -> Result<Vec<KVWithMetadata>, DescriptorError> {
        Err(DescriptorError::Unsupported("retrieve"))
    }

    /// Preconditions of the value; all must be satisfied before the value is
    /// applied, and it is torn back down to pending when one is lost.
    fn dependencies(&self, _key: &Key, _value: &ConfigValue) -> Vec<Dependency> {
        Vec::new()
    }

    /// Values derived from this value, typically properties other values
    /// depend on. Their lifecycle is bound to this value.
    fn derived_values(&self, _key: &Key, _value: &ConfigValue) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Classifies a Create/Update/Delete failure: can the same value succeed
    /// if the operation is repeated? Per the contract everything is retriable
    /// unless the descriptor says otherwise.
    fn is_retriable_failure(&self, _err: &DescriptorError) -> bool {
        true
    }

    /// Whether the scheduler should keep a metadata map for this descriptor.
    fn with_metadata(&self) -> bool {
        false
    }

    /// Secondary index for the metadata map (e.g. a backend-assigned
    /// interface index), enabling `lookup_by_index`.
    fn metadata_index(&self, _metadata: &Metadata) -> Option<u64> {
        None
    }

    /// Names of descriptors whose `retrieve` output this descriptor needs
    /// correlated before its own `retrieve` runs during resync.
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Descriptor-defined value equality, used to decide whether an Update is
    /// needed at all. Representations may differ while describing the same
    /// configuration (e.g. MAC address case).
    fn value_equivalent(&self, _key: &Key, old: &ConfigValue, new: &ConfigValue) -> bool {
        old == new
    }

    /// Whether resync may delete values of this descriptor that were
    /// discovered in the backend (origin `Southbound`) but are not declared.
    fn cleanup_discovered(&self) -> bool {
        false
    }
}

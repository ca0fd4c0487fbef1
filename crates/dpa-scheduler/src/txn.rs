use std::collections::BTreeMap;
use std::fmt;

use dpa_model::{ConfigValue, Key};
use serde::{Deserialize, Serialize};

/// One northbound intent within a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Intent {
    Put { key: Key, value: ConfigValue },
    Delete { key: Key },
}

impl Intent {
    pub fn key(&self) -> &Key {
        match self {
            Intent::Put { key, .. } | Intent::Delete { key } => key,
        }
    }
}

/// An ordered batch of intents applied as one unit. Within a transaction the
/// last intent per key wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub intents: Vec<Intent>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: Key, value: ConfigValue) -> Self {
        self.intents.push(Intent::Put { key, value });
        self
    }

    pub fn delete(mut self, key: Key) -> Self {
        self.intents.push(Intent::Delete { key });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnKind {
    /// Incremental change submitted by a northbound client.
    Northbound,
    /// Full-state reconciliation.
    Resync,
    /// Re-attempt of previously failed retriable operations.
    Retry,
    /// Reaction to a southbound notification.
    SbNotification,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnKind::Northbound => "NB",
            TxnKind::Resync => "resync",
            TxnKind::Retry => "retry",
            TxnKind::SbNotification => "SB-notification",
        };
        f.write_str(s)
    }
}

/// Final disposition of one key after a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum KeyOutcome {
    Created,
    Updated,
    /// The change could not be applied in place; realized as delete+create.
    Recreated,
    Removed,
    /// Desired and actual value already matched.
    Unchanged,
    /// Left waiting for an unmet dependency; not an error.
    Pending,
    /// No registered descriptor owns the key; the value is parked.
    Unimplemented,
    /// Validation rejected the value; permanent until a new value arrives.
    Invalid { reason: String },
    /// A backend operation failed.
    Failed { error: String, retriable: bool },
}

impl KeyOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, KeyOutcome::Invalid { .. } | KeyOutcome::Failed { .. })
    }
}

/// Retrieval that had to be skipped during resync, leaving the descriptor's
/// keys untouched for that pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRetrieval {
    pub descriptor: String,
    pub error: String,
}

/// Per-key results of one executed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnResult {
    pub seq: u64,
    pub kind: TxnKind,
    pub outcomes: BTreeMap<Key, KeyOutcome>,
    /// Only populated by resync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_retrievals: Vec<SkippedRetrieval>,
}

impl TxnResult {
    pub fn outcome(&self, key: &Key) -> Option<&KeyOutcome> {
        self.outcomes.get(key)
    }

    /// Keys that ended in an error outcome, with the message.
    pub fn errors(&self) -> BTreeMap<&Key, String> {
        self.outcomes
            .iter()
            .filter_map(|(key, outcome)| match outcome {
                KeyOutcome::Invalid { reason } => Some((key, reason.clone())),
                KeyOutcome::Failed { error, .. } => Some((key, error.clone())),
                _ => None,
            })
            .collect()
    }

    /// True when nothing failed (pending and unimplemented values are not
    /// failures).
    pub fn is_clean(&self) -> bool {
        !self.outcomes.values().any(KeyOutcome::is_error) && self.skipped_retrievals.is_empty()
    }

    /// True when the transaction had no effect at all.
    pub fn is_noop(&self) -> bool {
        self.outcomes
            .values()
            .all(|outcome| matches!(outcome, KeyOutcome::Unchanged))
    }
}

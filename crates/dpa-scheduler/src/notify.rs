use dpa_model::Key;
use serde::{Deserialize, Serialize};

use crate::descriptor::KVWithMetadata;

/// Event pushed by a southbound watcher (link-state change, namespace
/// appeared, ...). The scheduler maps it into a scoped re-resolution of the
/// affected keys; pending values are never polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SbNotification {
    /// A value appeared in (or was changed by) the southbound plane.
    ValueAppeared { kv: KVWithMetadata },
    /// A value disappeared from the southbound plane.
    ValueVanished { key: Key },
}

impl SbNotification {
    pub fn key(&self) -> &Key {
        match self {
            SbNotification::ValueAppeared { kv } => &kv.key,
            SbNotification::ValueVanished { key } => key,
        }
    }
}

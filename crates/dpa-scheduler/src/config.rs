use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Tunables of the scheduler, loaded by the surrounding agent from its
/// configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    /// Number of executed transactions kept in the in-memory history.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            history_limit: 256,
        }
    }
}

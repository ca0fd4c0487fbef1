//! The scheduler facade: owns the graph, metadata maps, retry queue, and
//! transaction history, and serializes every mutation.

use std::collections::BTreeMap;
use std::time::Instant;

use dpa_model::{Key, KeyValuePair};
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::descriptor::ValueOrigin;
use crate::error::SchedulerError;
use crate::exec::ExecCtx;
use crate::graph::{Graph, ValueState};
use crate::history::{RecordedTxn, TxnHistory};
use crate::metadata::MetadataBroker;
use crate::notify::SbNotification;
use crate::registry::DescriptorRegistry;
use crate::resync::run_resync;
use crate::retry::RetryQueue;
use crate::txn::{Intent, Transaction, TxnKind, TxnResult};

/// Inspection view of one value's current disposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueStatus {
    pub key: Key,
    pub state: ValueState,
    pub origin: ValueOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Key>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dependency-aware configuration scheduler.
///
/// Exactly one transaction is planned and executed at a time; submissions
/// naturally serialize through `&mut self` (wrap the scheduler in a
/// [`SchedulerService`](crate::SchedulerService) for a queued, multi-client
/// front-end). All collaborators are injected; there is no global state.
pub struct KVScheduler {
    config: SchedulerConfig,
    registry: DescriptorRegistry,
    metadata: MetadataBroker,
    graph: Graph,
    retries: RetryQueue,
    history: TxnHistory,
    next_seq: u64,
}

impl KVScheduler {
    pub fn new(
        registry: DescriptorRegistry,
        metadata: MetadataBroker,
        config: SchedulerConfig,
    ) -> Self {
        let history = TxnHistory::new(config.history_limit);
        Self {
            config,
            registry,
            metadata,
            graph: Graph::new(),
            retries: RetryQueue::new(),
            history,
            next_seq: 0,
        }
    }

    /// Applies an incremental batch of put/delete intents.
    pub fn commit(&mut self, txn: Transaction) -> Result<TxnResult, SchedulerError> {
        let seq = self.take_seq();
        let output = ExecCtx {
            registry: &self.registry,
            graph: &mut self.graph,
            metadata: &self.metadata,
            retries: &mut self.retries,
            retry_policy: &self.config.retry,
            now: Instant::now(),
            seq,
            bump_revision: true,
            base_attempts: BTreeMap::new(),
        }
        .run_transaction(TxnKind::Northbound, txn)?;
        self.history.record(output.record);
        Ok(output.result)
    }

    /// Reconciles the full declared state against the live backend state.
    pub fn resync(&mut self, declared: Vec<KeyValuePair>) -> Result<TxnResult, SchedulerError> {
        let seq = self.take_seq();
        let mut ctx = ExecCtx {
            registry: &self.registry,
            graph: &mut self.graph,
            metadata: &self.metadata,
            retries: &mut self.retries,
            retry_policy: &self.config.retry,
            now: Instant::now(),
            seq,
            bump_revision: true,
            base_attempts: BTreeMap::new(),
        };
        let output = run_resync(&mut ctx, declared)?;
        self.history.record(output.record);
        Ok(output.result)
    }

    /// Applies a southbound notification and re-resolves affected pending
    /// values.
    pub fn handle_notification(&mut self, notification: SbNotification) -> TxnResult {
        let seq = self.take_seq();
        let output = ExecCtx {
            registry: &self.registry,
            graph: &mut self.graph,
            metadata: &self.metadata,
            retries: &mut self.retries,
            retry_policy: &self.config.retry,
            now: Instant::now(),
            seq,
            bump_revision: false,
            base_attempts: BTreeMap::new(),
        }
        .run_notification(notification);
        self.history.record(output.record);
        output.result
    }

    /// Executes every retry due at `now` as one retry transaction. Retries
    /// made obsolete by a newer write of the same key are dropped.
    pub fn process_retries(&mut self, now: Instant) -> Vec<TxnResult> {
        let due = self.retries.take_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        let mut txn = Transaction::new();
        let mut base_attempts: BTreeMap<Key, u32> = BTreeMap::new();
        for entry in due {
            let Some(node) = self.graph.node(&entry.key) else {
                continue;
            };
            if node.revision > entry.revision {
                log::debug!("dropping obsolete retry for {}", entry.key);
                continue;
            }
            if node.pending_removal {
                txn.intents.push(Intent::Delete {
                    key: entry.key.clone(),
                });
            } else if let Some(value) = node.value.clone() {
                txn.intents.push(Intent::Put {
                    key: entry.key.clone(),
                    value,
                });
            } else {
                continue;
            }
            base_attempts.insert(entry.key, entry.attempt);
        }
        if txn.is_empty() {
            return Vec::new();
        }
        let seq = self.take_seq();
        let outcome = ExecCtx {
            registry: &self.registry,
            graph: &mut self.graph,
            metadata: &self.metadata,
            retries: &mut self.retries,
            retry_policy: &self.config.retry,
            now,
            seq,
            bump_revision: false,
            base_attempts,
        }
        .run_transaction(TxnKind::Retry, txn);
        match outcome {
            Ok(output) => {
                self.history.record(output.record);
                vec![output.result]
            }
            Err(err) => {
                // Planning a retry cannot introduce new cycles; log and move on.
                log::warn!("retry transaction rejected: {err}");
                Vec::new()
            }
        }
    }

    /// When the earliest queued retry becomes due, if any.
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retries.next_due()
    }

    pub fn value_status(&self, key: &Key) -> Option<ValueStatus> {
        self.graph.node(key).map(|node| ValueStatus {
            key: node.key.clone(),
            state: node.state,
            origin: node.origin,
            descriptor: node.descriptor.clone(),
            derived_from: node.derived_from.clone(),
            error: node.error.clone(),
        })
    }

    /// Declared values currently waiting for a dependency.
    pub fn pending_values(&self) -> Vec<KeyValuePair> {
        self.graph
            .nodes()
            .filter(|node| node.state == ValueState::Pending)
            .filter_map(|node| {
                node.value
                    .clone()
                    .map(|value| KeyValuePair::new(node.key.clone(), value))
            })
            .collect()
    }

    /// Values whose last operation failed, with the error message.
    pub fn failed_values(&self) -> Vec<(Key, String)> {
        self.graph
            .nodes()
            .filter(|node| node.state == ValueState::Failed)
            .map(|node| {
                (
                    node.key.clone(),
                    node.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )
            })
            .collect()
    }

    /// Read-only metadata access point; clones share the underlying maps.
    pub fn metadata_broker(&self) -> MetadataBroker {
        self.metadata.clone()
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn history(&self) -> impl Iterator<Item = &RecordedTxn> {
        self.history.records()
    }

    pub fn recorded_transaction(&self, seq: u64) -> Option<&RecordedTxn> {
        self.history.get(seq)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

//! Full-state reconciliation between declared and live configuration.
//!
//! For every descriptor, in registry retrieve-order: collect the declared
//! values it owns, ask it to retrieve the live ones (correlated against the
//! declared set), fold the result into the graph as the actual state, then
//! hand the declared set plus the required cleanups to the transaction
//! executor as one resync transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dpa_model::{Key, KeyValuePair};

use crate::descriptor::{KVDescriptor, KVWithMetadata, ValueOrigin};
use crate::error::SchedulerError;
use crate::exec::{ExecCtx, ExecOutput};
use crate::graph::{Node, ValueState};
use crate::txn::{SkippedRetrieval, Transaction, TxnKind};

pub(crate) fn run_resync(
    ctx: &mut ExecCtx<'_>,
    declared: Vec<KeyValuePair>,
) -> Result<ExecOutput, SchedulerError> {
    let order = ctx.registry.retrieve_order()?;

    let mut declared_by_descriptor: BTreeMap<String, Vec<KeyValuePair>> = BTreeMap::new();
    let mut unowned: Vec<KeyValuePair> = Vec::new();
    for kv in declared {
        match ctx.registry.resolve(&kv.key) {
            Some(descriptor) => declared_by_descriptor
                .entry(descriptor.name().to_string())
                .or_default()
                .push(kv),
            None => unowned.push(kv),
        }
    }

    // Refresh phase: fold the live state into the graph, descriptor by
    // descriptor. A failed retrieval takes its descriptor out of this pass
    // but never blocks the others.
    let mut skipped: Vec<SkippedRetrieval> = Vec::new();
    for name in &order {
        let Some(descriptor) = ctx.registry.get(name).cloned() else {
            continue;
        };
        if !descriptor.supports_retrieve() {
            continue;
        }
        let expected: Vec<KVWithMetadata> = declared_by_descriptor
            .get(name)
            .into_iter()
            .flatten()
            .map(|kv| KVWithMetadata {
                key: kv.key.clone(),
                value: kv.value.clone(),
                metadata: ctx.graph.node(&kv.key).and_then(|n| n.metadata.clone()),
                origin: ValueOrigin::Northbound,
            })
            .collect();
        match descriptor.retrieve(&expected) {
            Ok(retrieved) => refresh_descriptor_state(ctx, &descriptor, &expected, retrieved),
            Err(err) => {
                log::warn!("retrieval failed for descriptor '{name}': {err}");
                skipped.push(SkippedRetrieval {
                    descriptor: name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    let skipped_names: BTreeSet<&str> = skipped.iter().map(|s| s.descriptor.as_str()).collect();

    // Diff phase: declared values become puts, undeclared leftovers become
    // deletes, and the executor turns the difference into backend calls.
    let mut txn = Transaction::new();
    let mut declared_keys: BTreeSet<Key> = BTreeSet::new();
    for (name, pairs) in &declared_by_descriptor {
        if skipped_names.contains(name.as_str()) {
            continue;
        }
        for kv in pairs {
            declared_keys.insert(kv.key.clone());
            txn = txn.put(kv.key.clone(), kv.value.clone());
        }
    }
    for kv in unowned {
        declared_keys.insert(kv.key.clone());
        txn = txn.put(kv.key, kv.value);
    }

    let mut deletions: Vec<Key> = Vec::new();
    for node in ctx.graph.base_nodes() {
        if declared_keys.contains(&node.key) {
            continue;
        }
        match &node.descriptor {
            Some(name) => {
                if skipped_names.contains(name.as_str()) {
                    continue;
                }
                let cleanup = match node.origin {
                    ValueOrigin::Northbound => true,
                    ValueOrigin::Southbound => ctx
                        .registry
                        .get(name)
                        .is_some_and(|d| d.cleanup_discovered()),
                    ValueOrigin::Unknown => false,
                };
                if cleanup {
                    deletions.push(node.key.clone());
                }
            }
            None => {
                // Parked unimplemented values dropped from the declared set.
                if node.origin == ValueOrigin::Northbound && node.value.is_some() {
                    deletions.push(node.key.clone());
                }
            }
        }
    }
    for key in deletions {
        txn = txn.delete(key);
    }

    let mut output = ctx.run_transaction(TxnKind::Resync, txn)?;
    output.result.skipped_retrievals = skipped;
    Ok(output)
}

/// Folds one descriptor's retrieved snapshot into the graph: retrieved
/// values (and their derivations) become the applied state, while values the
/// scheduler believed applied but that were not retrieved lose their applied
/// state. Pure graph surgery; no backend calls.
fn refresh_descriptor_state(
    ctx: &mut ExecCtx<'_>,
    descriptor: &Arc<dyn KVDescriptor>,
    expected: &[KVWithMetadata],
    retrieved: Vec<KVWithMetadata>,
) {
    let expected_keys: BTreeSet<&Key> = expected.iter().map(|kv| &kv.key).collect();
    let mut retrieved_keys: BTreeSet<Key> = BTreeSet::new();

    for kv in retrieved {
        let KVWithMetadata {
            key,
            value,
            metadata,
            origin,
        } = kv;
        if !descriptor.key_selector(&key) {
            log::warn!(
                "descriptor '{}' retrieved foreign key {key}, ignoring",
                descriptor.name()
            );
            continue;
        }
        let origin = match origin {
            ValueOrigin::Unknown => {
                let previously_managed = ctx
                    .graph
                    .node(&key)
                    .is_some_and(|node| node.origin == ValueOrigin::Northbound);
                if expected_keys.contains(&key) || previously_managed {
                    ValueOrigin::Northbound
                } else {
                    ValueOrigin::Southbound
                }
            }
            other => other,
        };
        retrieved_keys.insert(key.clone());

        let mut node = ctx
            .graph
            .remove(&key)
            .unwrap_or_else(|| Node::new(key.clone()));
        node.value = Some(value.clone());
        node.applied = Some(value.clone());
        node.origin = origin;
        node.state = ValueState::Configured;
        node.error = None;
        node.pending_removal = false;
        node.derived_from = None;
        node.descriptor = Some(descriptor.name().to_string());
        node.dependencies = descriptor.dependencies(&key, &value);
        node.metadata = metadata.clone();
        let derived = descriptor.derived_values(&key, &value);
        node.derived = derived.iter().map(|d| d.key.clone()).collect();
        ctx.graph.upsert(node);

        if descriptor.with_metadata() {
            match metadata {
                Some(metadata) => {
                    let index = descriptor.metadata_index(&metadata);
                    ctx.metadata
                        .store(descriptor.name(), key.clone(), metadata, index);
                }
                None => {
                    ctx.metadata.clear(descriptor.name(), &key);
                }
            }
        }
        for derived_kv in derived {
            refresh_derived_state(ctx, derived_kv, &key, origin);
        }
    }

    // Values the scheduler believed applied but the backend no longer has.
    let stale: Vec<Key> = ctx
        .graph
        .base_nodes()
        .filter(|node| {
            node.descriptor.as_deref() == Some(descriptor.name())
                && node.applied.is_some()
                && !retrieved_keys.contains(&node.key)
        })
        .map(|node| node.key.clone())
        .collect();
    for key in stale {
        let Some(node) = ctx.graph.node(&key) else {
            continue;
        };
        for child in node.derived.clone() {
            drop_refreshed_subtree(ctx, &child);
        }
        ctx.metadata.clear(descriptor.name(), &key);
        if ctx.graph.node(&key).is_some_and(|n| n.origin == ValueOrigin::Southbound) {
            ctx.graph.remove(&key);
        } else if let Some(node) = ctx.graph.node_mut(&key) {
            node.applied = None;
            node.metadata = None;
            node.state = ValueState::Pending;
            node.derived = Vec::new();
        }
    }
}

fn refresh_derived_state(
    ctx: &mut ExecCtx<'_>,
    kv: KeyValuePair,
    parent: &Key,
    origin: ValueOrigin,
) {
    let KeyValuePair { key, value } = kv;
    let descriptor = ctx.registry.resolve(&key).cloned();
    let mut node = ctx
        .graph
        .remove(&key)
        .unwrap_or_else(|| Node::new(key.clone()));
    node.value = Some(value.clone());
    node.applied = Some(value.clone());
    node.origin = origin;
    node.state = ValueState::Configured;
    node.error = None;
    node.derived_from = Some(parent.clone());
    node.descriptor = descriptor.as_ref().map(|d| d.name().to_string());
    let derived = descriptor
        .as_ref()
        .map(|d| d.derived_values(&key, &value))
        .unwrap_or_default();
    node.derived = derived.iter().map(|d| d.key.clone()).collect();
    node.dependencies = descriptor
        .as_ref()
        .map(|d| d.dependencies(&key, &value))
        .unwrap_or_default();
    ctx.graph.upsert(node);
    for derived_kv in derived {
        refresh_derived_state(ctx, derived_kv, &key, origin);
    }
}

fn drop_refreshed_subtree(ctx: &mut ExecCtx<'_>, key: &Key) {
    let Some(node) = ctx.graph.node(key) else {
        return;
    };
    let children = node.derived.clone();
    let descriptor = node.descriptor.clone();
    let had_metadata = node.metadata.is_some();
    for child in children {
        drop_refreshed_subtree(ctx, &child);
    }
    if let (Some(descriptor), true) = (descriptor, had_metadata) {
        ctx.metadata.clear(&descriptor, key);
    }
    ctx.graph.remove(key);
}

//! Transaction planning and execution.
//!
//! One executor invocation owns the graph for its whole duration. The plan
//! is computed (and cycles rejected) before the first descriptor call;
//! deletes run in reverse dependency order, creates and updates forward,
//! and a worklist promotes pending values whose dependencies become
//! satisfied within the same pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use dpa_model::{ConfigValue, Key};
use indexmap::IndexMap;

use crate::descriptor::{DepTarget, Dependency, KVDescriptor, ValueOrigin};
use crate::error::{DescriptorError, SchedulerError};
use crate::graph::{Graph, Node, ValueState, topological_order};
use crate::history::{OpKind, RecordedOp, RecordedTxn};
use crate::metadata::MetadataBroker;
use crate::notify::SbNotification;
use crate::registry::DescriptorRegistry;
use crate::retry::{RetryPolicy, RetryQueue};
use crate::txn::{Intent, KeyOutcome, Transaction, TxnKind, TxnResult};

pub(crate) struct ExecCtx<'a> {
    pub registry: &'a DescriptorRegistry,
    pub graph: &'a mut Graph,
    pub metadata: &'a MetadataBroker,
    pub retries: &'a mut RetryQueue,
    pub retry_policy: &'a RetryPolicy,
    pub now: Instant,
    pub seq: u64,
    /// Northbound and resync writes stamp nodes with the transaction
    /// sequence; retries must not, so that a retry never masks a newer write.
    pub bump_revision: bool,
    /// For retry transactions: attempt number already consumed per key.
    pub base_attempts: BTreeMap<Key, u32>,
}

pub(crate) struct ExecOutput {
    pub result: TxnResult,
    pub record: RecordedTxn,
}

#[derive(Default)]
struct Out {
    outcomes: BTreeMap<Key, KeyOutcome>,
    ops: Vec<RecordedOp>,
}

impl Out {
    fn record_op(
        &mut self,
        key: &Key,
        operation: OpKind,
        prev_state: ValueState,
        new_state: ValueState,
        error: Option<String>,
    ) {
        self.ops.push(RecordedOp {
            key: key.clone(),
            operation,
            prev_state,
            new_state,
            error,
        });
    }
}

struct WorkItem {
    key: Key,
    value: ConfigValue,
    origin: ValueOrigin,
    derived_from: Option<Key>,
}

impl ExecCtx<'_> {
    pub fn run_transaction(
        &mut self,
        kind: TxnKind,
        txn: Transaction,
    ) -> Result<ExecOutput, SchedulerError> {
        let started = SystemTime::now();
        let mut out = Out::default();

        // Within one transaction the last intent per key wins.
        let mut merged: IndexMap<Key, Intent> = IndexMap::new();
        for intent in txn.intents {
            merged.insert(intent.key().clone(), intent);
        }

        let mut staged: BTreeMap<Key, StagedPut> = BTreeMap::new();
        let mut deletes: BTreeSet<Key> = BTreeSet::new();
        for (key, intent) in merged {
            match intent {
                Intent::Delete { .. } => {
                    deletes.insert(key);
                }
                Intent::Put { value, .. } => {
                    if self
                        .graph
                        .node(&key)
                        .is_some_and(|node| node.derived_from.is_some())
                    {
                        out.outcomes.insert(
                            key,
                            KeyOutcome::Invalid {
                                reason: "derived values cannot be set directly".to_string(),
                            },
                        );
                        continue;
                    }
                    let descriptor = self.registry.resolve(&key).cloned();
                    let deps = descriptor
                        .as_ref()
                        .map(|d| d.dependencies(&key, &value))
                        .unwrap_or_default();
                    staged.insert(
                        key,
                        StagedPut {
                            value,
                            descriptor,
                            deps,
                        },
                    );
                }
            }
        }

        // Reject cycles before the first backend call. The check spans the
        // staged values plus every unconfigured value reachable from them
        // through plain-key dependencies.
        let order = self.plan_order(&staged)?;
        let delete_order = topological_order(&deletes, |key| {
            self.graph
                .node(key)
                .map(|node| node.dependencies.clone())
                .unwrap_or_default()
        })?;

        for key in delete_order.iter().rev() {
            self.apply_delete(key, &mut out);
        }

        let mut worklist: VecDeque<WorkItem> = order
            .into_iter()
            .filter_map(|key| {
                staged.get(&key).map(|put| WorkItem {
                    key: key.clone(),
                    value: put.value.clone(),
                    origin: ValueOrigin::Northbound,
                    derived_from: None,
                })
            })
            .collect();
        while let Some(item) = worklist.pop_front() {
            self.apply_value(item, &mut out, &mut worklist);
        }

        Ok(self.finish(kind, started, out))
    }

    /// Applies a southbound notification: a value appeared or vanished
    /// outside of any northbound transaction.
    pub fn run_notification(&mut self, notification: SbNotification) -> ExecOutput {
        let started = SystemTime::now();
        let mut out = Out::default();
        let mut worklist: VecDeque<WorkItem> = VecDeque::new();

        match notification {
            SbNotification::ValueAppeared { kv } => {
                let descriptor = self.registry.resolve(&kv.key).cloned();
                let nb_owned = self
                    .graph
                    .node(&kv.key)
                    .is_some_and(|node| node.origin == ValueOrigin::Northbound);
                if nb_owned {
                    // Refresh runtime metadata of a value we manage.
                    if let (Some(node), Some(meta)) =
                        (self.graph.node_mut(&kv.key), kv.metadata.clone())
                    {
                        node.metadata = Some(meta.clone());
                        if let Some(descriptor) = &descriptor {
                            if descriptor.with_metadata() {
                                let index = descriptor.metadata_index(&meta);
                                self.metadata
                                    .store(descriptor.name(), kv.key.clone(), meta, index);
                            }
                        }
                    }
                } else {
                    let mut node = Node::new(kv.key.clone());
                    node.value = Some(kv.value.clone());
                    node.applied = Some(kv.value);
                    node.origin = ValueOrigin::Southbound;
                    node.state = ValueState::Configured;
                    node.metadata = kv.metadata.clone();
                    node.descriptor = descriptor.as_ref().map(|d| d.name().to_string());
                    self.graph.upsert(node);
                    if let (Some(descriptor), Some(meta)) = (&descriptor, kv.metadata) {
                        if descriptor.with_metadata() {
                            let index = descriptor.metadata_index(&meta);
                            self.metadata
                                .store(descriptor.name(), kv.key.clone(), meta, index);
                        }
                    }
                }
                self.promote_dependents(&kv.key, &mut worklist);
            }
            SbNotification::ValueVanished { key } => {
                if self.graph.contains(&key) {
                    self.teardown_dependents(&key, &mut out);
                    let node = self.graph.node_mut(&key).expect("node checked above");
                    if node.origin == ValueOrigin::Southbound {
                        let descriptor = node.descriptor.clone();
                        self.graph.remove(&key);
                        if let Some(descriptor) = descriptor {
                            self.metadata.clear(&descriptor, &key);
                        }
                    } else {
                        // The backend lost a value we manage; re-create it
                        // as soon as its dependencies allow.
                        node.applied = None;
                        node.metadata = None;
                        node.state = ValueState::Pending;
                        if let Some(descriptor) = node.descriptor.clone() {
                            self.metadata.clear(&descriptor, &key);
                        }
                        if let Some(value) = self
                            .graph
                            .node(&key)
                            .and_then(|node| node.value.clone())
                        {
                            worklist.push_back(WorkItem {
                                key: key.clone(),
                                value,
                                origin: ValueOrigin::Northbound,
                                derived_from: None,
                            });
                        }
                    }
                    // Dependents that can be satisfied another way (any-of)
                    // are re-evaluated right away.
                    for pending in self.graph.pending_keys() {
                        self.promote_if_ready(&pending, &mut worklist);
                    }
                }
            }
        }

        while let Some(item) = worklist.pop_front() {
            self.apply_value(item, &mut out, &mut worklist);
        }
        self.finish(TxnKind::SbNotification, started, out)
    }

    fn finish(&mut self, kind: TxnKind, started: SystemTime, out: Out) -> ExecOutput {
        let result = TxnResult {
            seq: self.seq,
            kind,
            outcomes: out.outcomes,
            skipped_retrievals: Vec::new(),
        };
        let record = RecordedTxn {
            seq: self.seq,
            kind,
            started,
            finished: SystemTime::now(),
            ops: out.ops,
        };
        log::debug!(
            "txn #{} ({}) done: {} op(s), {} outcome(s)",
            self.seq,
            kind,
            record.ops.len(),
            result.outcomes.len()
        );
        ExecOutput { result, record }
    }

    fn plan_order(&self, staged: &BTreeMap<Key, StagedPut>) -> Result<Vec<Key>, SchedulerError> {
        let mut check: BTreeSet<Key> = staged.keys().cloned().collect();
        let mut frontier: Vec<Key> = check.iter().cloned().collect();
        while let Some(key) = frontier.pop() {
            let deps = self.deps_for_planning(staged, &key);
            for dep in deps {
                if let DepTarget::Key(target) = dep.target {
                    let relevant = staged.contains_key(&target)
                        || self
                            .graph
                            .node(&target)
                            .is_some_and(|node| !node.is_configured());
                    if relevant && check.insert(target.clone()) {
                        frontier.push(target);
                    }
                }
            }
        }
        topological_order(&check, |key| self.deps_for_planning(staged, key))
    }

    fn deps_for_planning(&self, staged: &BTreeMap<Key, StagedPut>, key: &Key) -> Vec<Dependency> {
        staged
            .get(key)
            .map(|put| put.deps.clone())
            .or_else(|| self.graph.node(key).map(|node| node.dependencies.clone()))
            .unwrap_or_default()
    }

    fn descriptor_by_name(&self, name: &str) -> Option<Arc<dyn KVDescriptor>> {
        self.registry.get(name).cloned()
    }

    // --- delete path -----------------------------------------------------

    fn apply_delete(&mut self, key: &Key, out: &mut Out) {
        let Some(node) = self.graph.node(key) else {
            log::warn!("delete for unknown key {key}, nothing to do");
            out.outcomes.insert(key.clone(), KeyOutcome::Unchanged);
            return;
        };
        if node.derived_from.is_some() {
            out.outcomes.insert(
                key.clone(),
                KeyOutcome::Invalid {
                    reason: "derived values cannot be deleted directly".to_string(),
                },
            );
            return;
        }
        self.retries.remove(key);
        self.teardown_dependents(key, out);
        let outcome = self.unapply_and_drop(key, out);
        out.outcomes.insert(key.clone(), outcome);
    }

    /// Un-applies every configured northbound dependent of `key`,
    /// dependents-of-dependents first. Their desired values stay in the
    /// graph as pending, ready for automatic recreation.
    fn teardown_dependents(&mut self, key: &Key, out: &mut Out) {
        for dep_key in self.graph.dependents_of(key) {
            let Some(node) = self.graph.node(&dep_key) else {
                continue;
            };
            if !node.is_configured() || node.origin == ValueOrigin::Southbound {
                continue;
            }
            // A dependent kept configured by another any-of candidate stays.
            let still_satisfied = node.dependencies.iter().all(|dep| {
                !dep.matches(key) || self.dependency_satisfied_without(dep, key)
            });
            if still_satisfied {
                continue;
            }
            self.teardown_dependents(&dep_key, out);
            self.teardown_value(&dep_key, out);
        }
    }

    fn dependency_satisfied_without(&self, dep: &Dependency, removed: &Key) -> bool {
        match &dep.target {
            DepTarget::Key(target) => target != removed && self.graph.dependency_satisfied(dep),
            DepTarget::AnyOf { .. } => self.graph.nodes().any(|node| {
                node.key != *removed && dep.matches(&node.key) && node.is_configured()
            }),
        }
    }

    /// Removes the value from the backend but keeps the node (desired value
    /// intact) in the pending state.
    fn teardown_value(&mut self, key: &Key, out: &mut Out) {
        let Some(node) = self.graph.node(key) else {
            return;
        };
        for child in node.derived.clone() {
            self.remove_derived(&child, out);
        }
        let Some(node) = self.graph.node(key) else {
            return;
        };
        let prev_state = node.state;
        let applied = node.applied.clone();
        let metadata = node.metadata.clone();
        let descriptor = node
            .descriptor
            .clone()
            .and_then(|name| self.descriptor_by_name(&name));
        match (applied, descriptor) {
            (Some(applied), Some(descriptor)) => {
                match descriptor.delete(key, &applied, metadata.as_ref()) {
                    Ok(()) => {
                        self.clear_metadata(descriptor.as_ref(), key);
                        let node = self.graph.node_mut(key).expect("node checked above");
                        node.applied = None;
                        node.state = ValueState::Pending;
                        node.error = None;
                        node.derived = Vec::new();
                        out.record_op(key, OpKind::Delete, prev_state, ValueState::Pending, None);
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let node = self.graph.node_mut(key).expect("node checked above");
                        node.state = ValueState::Failed;
                        node.error = Some(message.clone());
                        out.record_op(
                            key,
                            OpKind::Delete,
                            prev_state,
                            ValueState::Failed,
                            Some(message),
                        );
                    }
                }
            }
            _ => {
                let node = self.graph.node_mut(key).expect("node checked above");
                node.state = ValueState::Pending;
                node.derived = Vec::new();
            }
        }
    }

    /// Removes the value from the backend and drops the node entirely
    /// (derived values first). On a failed backend delete the node stays
    /// with `pending_removal` set and a retry scheduled.
    fn unapply_and_drop(&mut self, key: &Key, out: &mut Out) -> KeyOutcome {
        let Some(node) = self.graph.node(key) else {
            return KeyOutcome::Unchanged;
        };
        for child in node.derived.clone() {
            self.remove_derived(&child, out);
        }
        let node = self.graph.node(key).expect("node checked above");
        let prev_state = node.state;
        let applied = node.applied.clone();
        let metadata = node.metadata.clone();
        let descriptor = node
            .descriptor
            .clone()
            .and_then(|name| self.descriptor_by_name(&name));
        match (applied, descriptor) {
            (Some(applied), Some(descriptor)) => {
                match descriptor.delete(key, &applied, metadata.as_ref()) {
                    Ok(()) => {
                        self.clear_metadata(descriptor.as_ref(), key);
                        self.graph.remove(key);
                        out.record_op(key, OpKind::Delete, prev_state, ValueState::Removed, None);
                        KeyOutcome::Removed
                    }
                    Err(err) => {
                        let retriable = self.classify(descriptor.as_ref(), &err);
                        let message = err.to_string();
                        let node = self.graph.node_mut(key).expect("node checked above");
                        node.state = ValueState::Failed;
                        node.error = Some(message.clone());
                        node.value = None;
                        node.pending_removal = true;
                        if self.bump_revision {
                            node.revision = self.seq;
                        }
                        out.record_op(
                            key,
                            OpKind::Delete,
                            prev_state,
                            ValueState::Failed,
                            Some(message.clone()),
                        );
                        self.schedule_retry(key, retriable);
                        KeyOutcome::Failed {
                            error: message,
                            retriable,
                        }
                    }
                }
            }
            _ => {
                // Never applied; nothing to undo in the backend.
                self.graph.remove(key);
                out.record_op(key, OpKind::Delete, prev_state, ValueState::Removed, None);
                KeyOutcome::Removed
            }
        }
    }

    /// Drops a derived value together with its own derived children and
    /// tears down whatever depended on it.
    fn remove_derived(&mut self, key: &Key, out: &mut Out) {
        let Some(node) = self.graph.node(key) else {
            return;
        };
        for child in node.derived.clone() {
            self.remove_derived(&child, out);
        }
        self.teardown_dependents(key, out);
        let Some(node) = self.graph.node(key) else {
            return;
        };
        let prev_state = node.state;
        let applied = node.applied.clone();
        let metadata = node.metadata.clone();
        let descriptor = node
            .descriptor
            .clone()
            .and_then(|name| self.descriptor_by_name(&name));
        if let (Some(applied), Some(descriptor)) = (applied, descriptor) {
            match descriptor.delete(key, &applied, metadata.as_ref()) {
                Ok(()) => {
                    self.clear_metadata(descriptor.as_ref(), key);
                    out.record_op(key, OpKind::Delete, prev_state, ValueState::Removed, None);
                }
                Err(err) => {
                    log::warn!("failed to delete derived value {key}: {err}");
                    out.record_op(
                        key,
                        OpKind::Delete,
                        prev_state,
                        ValueState::Removed,
                        Some(err.to_string()),
                    );
                }
            }
        }
        self.graph.remove(key);
    }

    // --- create/update path ----------------------------------------------

    fn apply_value(&mut self, item: WorkItem, out: &mut Out, worklist: &mut VecDeque<WorkItem>) {
        let WorkItem {
            key,
            value,
            origin,
            derived_from,
        } = item;

        if derived_from.is_some()
            && self
                .graph
                .node(&key)
                .is_some_and(|node| node.derived_from.is_none() && node.value.is_some())
        {
            log::warn!("derived value {key} collides with a base value, skipping");
            return;
        }

        let descriptor = self.registry.resolve(&key).cloned();
        let Some(descriptor) = descriptor else {
            if derived_from.is_some() {
                self.apply_property(key, value, origin, derived_from, out, worklist);
            } else {
                self.park_unimplemented(key, value, origin, out);
            }
            return;
        };

        let deps = descriptor.dependencies(&key, &value);
        let snapshot = self.snapshot(&key);
        self.stage_node(
            &key,
            &value,
            origin,
            &deps,
            derived_from.clone(),
            &snapshot,
        );

        if !self.graph.satisfied_dependencies(&deps) {
            if snapshot.applied.is_some() {
                // The applied value can no longer hold with its dependencies
                // unsatisfied; take it out of the backend.
                self.teardown_value(&key, out);
            } else {
                self.set_state(&key, ValueState::Pending);
            }
            out.outcomes.insert(key, KeyOutcome::Pending);
            return;
        }

        if let Err(err) = descriptor.validate(&key, &value) {
            let reason = err.to_string();
            let op = if snapshot.applied.is_some() {
                OpKind::Update
            } else {
                OpKind::Create
            };
            let node = self.graph.node_mut(&key).expect("node staged above");
            node.state = ValueState::Failed;
            node.error = Some(reason.clone());
            out.record_op(&key, op, snapshot.state, ValueState::Failed, Some(reason.clone()));
            out.outcomes.insert(key, KeyOutcome::Invalid { reason });
            return;
        }

        match snapshot.applied.clone() {
            Some(applied)
                if snapshot.state == ValueState::Configured
                    && descriptor.value_equivalent(&key, &applied, &value) =>
            {
                // A value promoted twice in one pass is already configured
                // the second time; keep the outcome of the real operation.
                out.outcomes.entry(key).or_insert(KeyOutcome::Unchanged);
            }
            Some(applied) => {
                let recreate = descriptor.update_with_recreate(
                    &key,
                    &applied,
                    &value,
                    snapshot.metadata.as_ref(),
                );
                if recreate {
                    self.recreate_value(
                        &key, &applied, value, &descriptor, &snapshot, out, worklist,
                    );
                } else {
                    self.update_value(&key, &applied, value, &descriptor, &snapshot, out, worklist);
                }
            }
            None => {
                self.create_value(&key, value, &descriptor, &snapshot, out, worklist, false);
            }
        }
    }

    fn apply_property(
        &mut self,
        key: Key,
        value: ConfigValue,
        origin: ValueOrigin,
        derived_from: Option<Key>,
        out: &mut Out,
        worklist: &mut VecDeque<WorkItem>,
    ) {
        let prev_state = self
            .graph
            .node(&key)
            .map(|node| node.state)
            .unwrap_or(ValueState::Pending);
        let mut node = self
            .graph
            .remove(&key)
            .unwrap_or_else(|| Node::new(key.clone()));
        node.value = Some(value.clone());
        node.applied = Some(value);
        node.origin = origin;
        node.state = ValueState::Configured;
        node.derived_from = derived_from;
        self.graph.upsert(node);
        if prev_state != ValueState::Configured {
            out.outcomes.insert(key.clone(), KeyOutcome::Created);
            self.promote_dependents(&key, worklist);
        } else {
            out.outcomes.insert(key, KeyOutcome::Unchanged);
        }
    }

    fn park_unimplemented(&mut self, key: Key, value: ConfigValue, origin: ValueOrigin, out: &mut Out) {
        log::warn!("no descriptor owns key {key}; value parked");
        let mut node = self
            .graph
            .remove(&key)
            .unwrap_or_else(|| Node::new(key.clone()));
        node.value = Some(value);
        node.origin = origin;
        node.state = ValueState::Pending;
        node.descriptor = None;
        if self.bump_revision {
            node.revision = self.seq;
        }
        self.graph.upsert(node);
        out.outcomes.insert(key, KeyOutcome::Unimplemented);
    }

    fn snapshot(&self, key: &Key) -> NodeSnapshot {
        self.graph
            .node(key)
            .map(|node| NodeSnapshot {
                state: node.state,
                applied: node.applied.clone(),
                metadata: node.metadata.clone(),
                derived: node.derived.clone(),
                revision: node.revision,
            })
            .unwrap_or_default()
    }

    fn stage_node(
        &mut self,
        key: &Key,
        value: &ConfigValue,
        origin: ValueOrigin,
        deps: &[Dependency],
        derived_from: Option<Key>,
        snapshot: &NodeSnapshot,
    ) {
        let mut node = self
            .graph
            .remove(key)
            .unwrap_or_else(|| Node::new(key.clone()));
        node.value = Some(value.clone());
        node.origin = origin;
        node.dependencies = deps.to_vec();
        node.derived_from = derived_from;
        node.descriptor = self
            .registry
            .resolve(key)
            .map(|descriptor| descriptor.name().to_string());
        node.pending_removal = false;
        node.revision = if self.bump_revision {
            self.seq
        } else {
            snapshot.revision
        };
        self.graph.upsert(node);
    }

    fn create_value(
        &mut self,
        key: &Key,
        value: ConfigValue,
        descriptor: &Arc<dyn KVDescriptor>,
        snapshot: &NodeSnapshot,
        out: &mut Out,
        worklist: &mut VecDeque<WorkItem>,
        recreated: bool,
    ) {
        self.set_state(key, ValueState::Configuring);
        match descriptor.create(key, &value) {
            Ok(metadata) => {
                self.store_metadata(descriptor.as_ref(), key, metadata);
                let node = self.graph.node_mut(key).expect("node staged above");
                node.applied = Some(value.clone());
                node.state = ValueState::Configured;
                node.error = None;
                self.retries.remove(key);
                out.record_op(
                    key,
                    OpKind::Create,
                    snapshot.state,
                    ValueState::Configured,
                    None,
                );
                out.outcomes.insert(
                    key.clone(),
                    if recreated {
                        KeyOutcome::Recreated
                    } else {
                        KeyOutcome::Created
                    },
                );
                self.refresh_derived(key, &value, descriptor, snapshot, out, worklist);
                self.promote_dependents(key, worklist);
            }
            Err(err) => {
                self.fail_value(key, OpKind::Create, descriptor, err, snapshot, out);
            }
        }
    }

    fn update_value(
        &mut self,
        key: &Key,
        applied: &ConfigValue,
        value: ConfigValue,
        descriptor: &Arc<dyn KVDescriptor>,
        snapshot: &NodeSnapshot,
        out: &mut Out,
        worklist: &mut VecDeque<WorkItem>,
    ) {
        self.set_state(key, ValueState::Configuring);
        match descriptor.update(key, applied, &value, snapshot.metadata.as_ref()) {
            Ok(metadata) => {
                self.store_metadata(descriptor.as_ref(), key, metadata);
                let node = self.graph.node_mut(key).expect("node staged above");
                node.applied = Some(value.clone());
                node.state = ValueState::Configured;
                node.error = None;
                self.retries.remove(key);
                out.record_op(
                    key,
                    OpKind::Update,
                    snapshot.state,
                    ValueState::Configured,
                    None,
                );
                out.outcomes.insert(key.clone(), KeyOutcome::Updated);
                self.refresh_derived(key, &value, descriptor, snapshot, out, worklist);
                self.promote_dependents(key, worklist);
            }
            Err(err) if err.is_unsupported() => {
                // No in-place update; fall back to full re-creation.
                self.recreate_value(key, applied, value, descriptor, snapshot, out, worklist);
            }
            Err(err) => {
                self.fail_value(key, OpKind::Update, descriptor, err, snapshot, out);
            }
        }
    }

    fn recreate_value(
        &mut self,
        key: &Key,
        applied: &ConfigValue,
        value: ConfigValue,
        descriptor: &Arc<dyn KVDescriptor>,
        snapshot: &NodeSnapshot,
        out: &mut Out,
        worklist: &mut VecDeque<WorkItem>,
    ) {
        // The derived values of the outgoing value go away with it.
        for child in snapshot.derived.clone() {
            self.remove_derived(&child, out);
        }
        self.set_state(key, ValueState::Configuring);
        match descriptor.delete(key, applied, snapshot.metadata.as_ref()) {
            Ok(()) => {
                self.clear_metadata(descriptor.as_ref(), key);
                let node = self.graph.node_mut(key).expect("node staged above");
                node.applied = None;
                node.derived = Vec::new();
                out.record_op(
                    key,
                    OpKind::Delete,
                    snapshot.state,
                    ValueState::Pending,
                    None,
                );
                let snapshot = self.snapshot(key);
                self.create_value(key, value, descriptor, &snapshot, out, worklist, true);
            }
            Err(err) => {
                self.fail_value(key, OpKind::Delete, descriptor, err, snapshot, out);
            }
        }
    }

    fn fail_value(
        &mut self,
        key: &Key,
        op: OpKind,
        descriptor: &Arc<dyn KVDescriptor>,
        err: DescriptorError,
        snapshot: &NodeSnapshot,
        out: &mut Out,
    ) {
        let retriable = self.classify(descriptor.as_ref(), &err);
        let message = err.to_string();
        log::warn!("{op:?} failed for {key}: {message} (retriable: {retriable})");
        let node = self.graph.node_mut(key).expect("node staged above");
        node.state = ValueState::Failed;
        node.error = Some(message.clone());
        out.record_op(key, op, snapshot.state, ValueState::Failed, Some(message.clone()));
        out.outcomes.insert(
            key.clone(),
            KeyOutcome::Failed {
                error: message,
                retriable,
            },
        );
        self.schedule_retry(key, retriable);
    }

    fn refresh_derived(
        &mut self,
        key: &Key,
        value: &ConfigValue,
        descriptor: &Arc<dyn KVDescriptor>,
        snapshot: &NodeSnapshot,
        out: &mut Out,
        worklist: &mut VecDeque<WorkItem>,
    ) {
        let derived = descriptor.derived_values(key, value);
        let new_keys: Vec<Key> = derived.iter().map(|kv| kv.key.clone()).collect();
        for obsolete in snapshot
            .derived
            .iter()
            .filter(|child| !new_keys.contains(child))
        {
            self.remove_derived(obsolete, out);
        }
        let origin = self
            .graph
            .node(key)
            .map(|node| node.origin)
            .unwrap_or(ValueOrigin::Northbound);
        if let Some(node) = self.graph.node_mut(key) {
            node.derived = new_keys;
        }
        for kv in derived {
            worklist.push_back(WorkItem {
                key: kv.key,
                value: kv.value,
                origin,
                derived_from: Some(key.clone()),
            });
        }
    }

    fn promote_dependents(&mut self, key: &Key, worklist: &mut VecDeque<WorkItem>) {
        for dep_key in self.graph.dependents_of(key) {
            self.promote_if_ready(&dep_key, worklist);
        }
    }

    fn promote_if_ready(&mut self, key: &Key, worklist: &mut VecDeque<WorkItem>) {
        let Some(node) = self.graph.node(key) else {
            return;
        };
        if node.state != ValueState::Pending || node.pending_removal || node.descriptor.is_none() {
            return;
        }
        let Some(value) = node.value.clone() else {
            return;
        };
        if !self.graph.satisfied_dependencies(&node.dependencies) {
            return;
        }
        worklist.push_back(WorkItem {
            key: key.clone(),
            value,
            origin: node.origin,
            derived_from: node.derived_from.clone(),
        });
    }

    // --- shared helpers --------------------------------------------------

    fn set_state(&mut self, key: &Key, state: ValueState) {
        if let Some(node) = self.graph.node_mut(key) {
            node.state = state;
        }
    }

    fn classify(&self, descriptor: &dyn KVDescriptor, err: &DescriptorError) -> bool {
        !err.is_unsupported() && descriptor.is_retriable_failure(err)
    }

    fn schedule_retry(&mut self, key: &Key, retriable: bool) {
        if !retriable {
            return;
        }
        let attempt = self.base_attempts.get(key).copied().unwrap_or(0) + 1;
        let revision = self
            .graph
            .node(key)
            .map(|node| node.revision)
            .unwrap_or(self.seq);
        if self
            .retries
            .schedule(self.retry_policy, key.clone(), attempt, revision, self.now)
        {
            log::debug!("scheduled retry #{attempt} for {key}");
        } else if self.retry_policy.enabled {
            log::warn!("retry budget exhausted for {key}");
        }
    }

    fn store_metadata(
        &mut self,
        descriptor: &dyn KVDescriptor,
        key: &Key,
        metadata: Option<dpa_model::Metadata>,
    ) {
        if !descriptor.with_metadata() {
            return;
        }
        match metadata {
            Some(metadata) => {
                let index = descriptor.metadata_index(&metadata);
                self.metadata
                    .store(descriptor.name(), key.clone(), metadata.clone(), index);
                if let Some(node) = self.graph.node_mut(key) {
                    node.metadata = Some(metadata);
                }
            }
            None => self.clear_metadata(descriptor, key),
        }
    }

    fn clear_metadata(&mut self, descriptor: &dyn KVDescriptor, key: &Key) {
        self.metadata.clear(descriptor.name(), key);
        if let Some(node) = self.graph.node_mut(key) {
            node.metadata = None;
        }
    }
}

struct StagedPut {
    value: ConfigValue,
    descriptor: Option<Arc<dyn KVDescriptor>>,
    deps: Vec<Dependency>,
}

#[derive(Default, Clone)]
struct NodeSnapshot {
    state: ValueState,
    applied: Option<ConfigValue>,
    metadata: Option<dpa_model::Metadata>,
    derived: Vec<Key>,
    revision: u64,
}

//! Incremental change-transaction scenarios.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dpa_model::{ConfigValue, Key, KeyValuePair, keys};
use dpa_scheduler::test_support::{CallLog, MockBackend, MockDescriptor, route_via, tap_interface};
use dpa_scheduler::{
    Dependency, DescriptorRegistry, InvalidValueError, KVScheduler, KeyOutcome, MetadataBroker,
    OpKind, SchedulerConfig, SchedulerError, Transaction, ValueState,
};

fn iface_key(name: &str) -> Key {
    keys::interface_key(name).unwrap()
}

fn rt_key(iface: &str, dst: &str) -> Key {
    keys::route_key(iface, dst).unwrap()
}

fn up_key(name: &str) -> Key {
    keys::interface_state_key(name, true).unwrap()
}

struct Fixture {
    scheduler: KVScheduler,
    log: CallLog,
    backend: MockBackend,
    iface: Arc<MockDescriptor>,
}

/// Interface descriptor derives a link-state property once enabled; route
/// descriptor depends on it.
fn fixture() -> Fixture {
    fixture_with_config(SchedulerConfig::default())
}

fn fixture_with_config(config: SchedulerConfig) -> Fixture {
    let log = CallLog::new();
    let backend = MockBackend::new();
    let iface = Arc::new(
        MockDescriptor::new("iface", keys::INTERFACE_KEY_PREFIX, log.clone(), backend.clone())
            .with_metadata()
            .retrieving()
            .with_derived(|_key, value| match value {
                ConfigValue::Interface(iface) if iface.enabled => vec![KeyValuePair::new(
                    keys::interface_state_key(&iface.name, true).unwrap(),
                    ConfigValue::Property,
                )],
                _ => Vec::new(),
            }),
    );
    let route = Arc::new(
        MockDescriptor::new("route", keys::ROUTE_KEY_PREFIX, log.clone(), backend.clone())
            .with_dependencies(|_key, value| match value {
                ConfigValue::Route(route) => vec![Dependency::on_key(
                    "interface is up",
                    keys::interface_state_key(&route.out_interface, true).unwrap(),
                )],
                _ => Vec::new(),
            }),
    );
    let mut registry = DescriptorRegistry::new();
    registry.register(iface.clone()).unwrap();
    registry.register(route).unwrap();
    let scheduler = KVScheduler::new(registry, MetadataBroker::new(), config);
    Fixture {
        scheduler,
        log,
        backend,
        iface,
    }
}

#[test]
fn unordered_submission_configures_in_dependency_order() {
    let mut fx = fixture();
    // Route submitted before the interface it needs.
    let result = fx
        .scheduler
        .commit(
            Transaction::new()
                .put(rt_key("tap0", "10.0.0.0/24"), route_via("tap0", "10.0.0.0/24"))
                .put(iface_key("tap0"), tap_interface("tap0")),
        )
        .unwrap();

    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Created));
    assert_eq!(
        result.outcome(&rt_key("tap0", "10.0.0.0/24")),
        Some(&KeyOutcome::Created)
    );

    let entries = fx.log.entries();
    let create_iface = fx.log.position("create:config/interface/tap0").unwrap();
    let create_route = entries
        .iter()
        .position(|e| e.starts_with("create:config/route/"))
        .unwrap();
    assert!(create_iface < create_route, "entries: {entries:?}");

    assert_eq!(
        fx.scheduler.value_status(&iface_key("tap0")).unwrap().state,
        ValueState::Configured
    );
    assert_eq!(
        fx.scheduler
            .value_status(&rt_key("tap0", "10.0.0.0/24"))
            .unwrap()
            .state,
        ValueState::Configured
    );
}

#[test]
fn dependency_ordering_visible_in_history() {
    let mut fx = fixture();
    let result = fx
        .scheduler
        .commit(
            Transaction::new()
                .put(rt_key("tap0", "10.0.0.0/24"), route_via("tap0", "10.0.0.0/24"))
                .put(iface_key("tap0"), tap_interface("tap0")),
        )
        .unwrap();

    let record = fx.scheduler.recorded_transaction(result.seq).unwrap();
    let iface_op = record
        .ops
        .iter()
        .position(|op| op.key == iface_key("tap0") && op.operation == OpKind::Create)
        .unwrap();
    let route_op = record
        .ops
        .iter()
        .position(|op| op.key == rt_key("tap0", "10.0.0.0/24") && op.operation == OpKind::Create)
        .unwrap();
    assert!(iface_op < route_op);
    assert!(record.ops.iter().all(|op| op.error.is_none()));
}

#[test]
fn value_stays_pending_until_dependency_arrives() {
    let mut fx = fixture();
    let result = fx
        .scheduler
        .commit(Transaction::new().put(
            rt_key("tap0", "10.0.0.0/24"),
            route_via("tap0", "10.0.0.0/24"),
        ))
        .unwrap();
    assert_eq!(
        result.outcome(&rt_key("tap0", "10.0.0.0/24")),
        Some(&KeyOutcome::Pending)
    );
    assert!(fx.log.entries().is_empty());

    // The dependency arrives in a later transaction; the route follows
    // without being re-submitted.
    let result = fx
        .scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Created));
    assert_eq!(
        fx.scheduler
            .value_status(&rt_key("tap0", "10.0.0.0/24"))
            .unwrap()
            .state,
        ValueState::Configured
    );
    assert!(fx.backend.contains(&rt_key("tap0", "10.0.0.0/24")));
}

#[test]
fn partial_failure_does_not_block_independent_keys() {
    let log = CallLog::new();
    let backend = MockBackend::new();
    let iface = Arc::new(
        MockDescriptor::new("iface", keys::INTERFACE_KEY_PREFIX, log.clone(), backend.clone())
            .with_validation(|_key, value| match value {
                ConfigValue::Interface(iface) if iface.name == "bad" => {
                    Err(InvalidValueError::with_fields("empty host name", ["host_if_name"]))
                }
                _ => Ok(()),
            }),
    );
    let mut registry = DescriptorRegistry::new();
    registry.register(iface).unwrap();
    let mut scheduler = KVScheduler::new(registry, MetadataBroker::new(), SchedulerConfig::default());

    let result = scheduler
        .commit(
            Transaction::new()
                .put(iface_key("tap0"), tap_interface("tap0"))
                .put(iface_key("bad"), tap_interface("bad"))
                .put(iface_key("tap1"), tap_interface("tap1")),
        )
        .unwrap();

    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Created));
    assert_eq!(result.outcome(&iface_key("tap1")), Some(&KeyOutcome::Created));
    assert!(matches!(
        result.outcome(&iface_key("bad")),
        Some(KeyOutcome::Invalid { .. })
    ));
    assert!(backend.contains(&iface_key("tap0")));
    assert!(backend.contains(&iface_key("tap1")));
    assert!(!backend.contains(&iface_key("bad")));

    // Invalid values are permanent failures: no retry was queued.
    assert!(scheduler.next_retry_due().is_none());
}

#[test]
fn dependency_cycle_rejected_before_any_backend_call() {
    let log = CallLog::new();
    let backend = MockBackend::new();
    let a = Arc::new(
        MockDescriptor::new("a", "config/a/", log.clone(), backend.clone()).with_dependencies(
            |_key, _value| vec![Dependency::on_key("b", Key::new("config/b/1").unwrap())],
        ),
    );
    let b = Arc::new(
        MockDescriptor::new("b", "config/b/", log.clone(), backend.clone()).with_dependencies(
            |_key, _value| vec![Dependency::on_key("a", Key::new("config/a/1").unwrap())],
        ),
    );
    let mut registry = DescriptorRegistry::new();
    registry.register(a).unwrap();
    registry.register(b).unwrap();
    let mut scheduler = KVScheduler::new(registry, MetadataBroker::new(), SchedulerConfig::default());

    let err = scheduler
        .commit(
            Transaction::new()
                .put(Key::new("config/a/1").unwrap(), ConfigValue::Property)
                .put(Key::new("config/b/1").unwrap(), ConfigValue::Property),
        )
        .unwrap_err();

    assert!(matches!(err, SchedulerError::DependencyCycle { .. }));
    assert!(log.entries().is_empty());
    assert!(backend.is_empty());
    assert!(scheduler.value_status(&Key::new("config/a/1").unwrap()).is_none());
}

#[test]
fn deleting_parent_removes_derived_values_and_parks_dependents() {
    let mut fx = fixture();
    fx.scheduler
        .commit(
            Transaction::new()
                .put(iface_key("tap0"), tap_interface("tap0"))
                .put(rt_key("tap0", "10.0.0.0/24"), route_via("tap0", "10.0.0.0/24")),
        )
        .unwrap();
    assert!(fx.scheduler.value_status(&up_key("tap0")).is_some());

    let result = fx
        .scheduler
        .commit(Transaction::new().delete(iface_key("tap0")))
        .unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Removed));

    // Derived link-state property went down with the parent, no explicit
    // delete needed.
    assert!(fx.scheduler.value_status(&up_key("tap0")).is_none());
    // The route lost its dependency: unapplied but still desired.
    assert_eq!(
        fx.scheduler
            .value_status(&rt_key("tap0", "10.0.0.0/24"))
            .unwrap()
            .state,
        ValueState::Pending
    );
    assert!(!fx.backend.contains(&rt_key("tap0", "10.0.0.0/24")));
    assert!(!fx.backend.contains(&iface_key("tap0")));

    // Re-creating the interface brings the route back automatically.
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    assert!(fx.backend.contains(&rt_key("tap0", "10.0.0.0/24")));
}

#[test]
fn equivalent_value_is_a_noop() {
    let mut fx = fixture();
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    fx.log.take();

    let result = fx
        .scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Unchanged));
    assert!(fx.log.entries().is_empty());
}

#[test]
fn update_without_in_place_support_recreates() {
    let log = CallLog::new();
    let backend = MockBackend::new();
    let iface = Arc::new(
        MockDescriptor::new("iface", keys::INTERFACE_KEY_PREFIX, log.clone(), backend.clone())
            .recreate_on_update(),
    );
    let mut registry = DescriptorRegistry::new();
    registry.register(iface).unwrap();
    let mut scheduler = KVScheduler::new(registry, MetadataBroker::new(), SchedulerConfig::default());

    scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    log.take();

    let mut changed = tap_interface("tap0");
    if let ConfigValue::Interface(iface) = &mut changed {
        iface.mtu = Some(9000);
    }
    let result = scheduler
        .commit(Transaction::new().put(iface_key("tap0"), changed))
        .unwrap();

    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Recreated));
    assert_eq!(
        log.entries(),
        vec![
            "delete:config/interface/tap0".to_string(),
            "create:config/interface/tap0".to_string(),
        ]
    );
}

#[test]
fn retriable_failure_heals_through_retry() {
    let mut fx = fixture();
    fx.iface.fail_create(iface_key("tap0"), 1, true);

    let before = Instant::now();
    let result = fx
        .scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    assert!(matches!(
        result.outcome(&iface_key("tap0")),
        Some(KeyOutcome::Failed { retriable: true, .. })
    ));
    assert_eq!(
        fx.scheduler.value_status(&iface_key("tap0")).unwrap().state,
        ValueState::Failed
    );

    let due = fx.scheduler.next_retry_due().expect("retry queued");
    assert!(due >= before);

    // Nothing happens before the backoff elapses.
    assert!(fx.scheduler.process_retries(before).is_empty());

    let results = fx.scheduler.process_retries(due + Duration::from_millis(1));
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].outcome(&iface_key("tap0")),
        Some(&KeyOutcome::Created)
    );
    assert_eq!(
        fx.scheduler.value_status(&iface_key("tap0")).unwrap().state,
        ValueState::Configured
    );
    assert!(fx.backend.contains(&iface_key("tap0")));
}

#[test]
fn retry_budget_is_bounded() {
    let mut fx = fixture_with_config(SchedulerConfig {
        retry: dpa_scheduler::RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        },
        ..Default::default()
    });
    fx.iface.fail_create(iface_key("tap0"), 10, true);

    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    let due = fx.scheduler.next_retry_due().expect("first retry queued");

    let results = fx.scheduler.process_retries(due + Duration::from_millis(1));
    assert!(matches!(
        results[0].outcome(&iface_key("tap0")),
        Some(KeyOutcome::Failed { .. })
    ));
    // Budget of one attempt is spent; no further retry.
    assert!(fx.scheduler.next_retry_due().is_none());
    assert_eq!(
        fx.scheduler.value_status(&iface_key("tap0")).unwrap().state,
        ValueState::Failed
    );
}

#[test]
fn newer_write_makes_queued_retry_obsolete() {
    let mut fx = fixture();
    fx.iface.fail_create(iface_key("tap0"), 1, true);
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    let due = fx.scheduler.next_retry_due().expect("retry queued");

    // A fresh write supersedes the failed one (and succeeds right away,
    // since the injected failure was consumed).
    let mut renamed = tap_interface("tap0");
    if let ConfigValue::Interface(iface) = &mut renamed {
        iface.mtu = Some(1400);
    }
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), renamed))
        .unwrap();

    let results = fx.scheduler.process_retries(due + Duration::from_secs(10));
    assert!(results.is_empty(), "obsolete retry must be dropped");
}

#[test]
fn failed_delete_is_retried_until_removed() {
    let mut fx = fixture();
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    fx.iface.fail_delete(iface_key("tap0"), 1, true);

    let result = fx
        .scheduler
        .commit(Transaction::new().delete(iface_key("tap0")))
        .unwrap();
    assert!(matches!(
        result.outcome(&iface_key("tap0")),
        Some(KeyOutcome::Failed { retriable: true, .. })
    ));
    // Still applied in the backend, still tracked for removal.
    assert!(fx.backend.contains(&iface_key("tap0")));

    let due = fx.scheduler.next_retry_due().expect("delete retry queued");
    let results = fx.scheduler.process_retries(due + Duration::from_millis(1));
    assert_eq!(
        results[0].outcome(&iface_key("tap0")),
        Some(&KeyOutcome::Removed)
    );
    assert!(!fx.backend.contains(&iface_key("tap0")));
    assert!(fx.scheduler.value_status(&iface_key("tap0")).is_none());
}

#[test]
fn non_retriable_failure_is_not_queued() {
    let mut fx = fixture();
    fx.iface.fail_create(iface_key("tap0"), 1, false);

    let result = fx
        .scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    assert!(matches!(
        result.outcome(&iface_key("tap0")),
        Some(KeyOutcome::Failed { retriable: false, .. })
    ));
    assert!(fx.scheduler.next_retry_due().is_none());
}

#[test]
fn metadata_follows_value_lifecycle() {
    let mut fx = fixture();
    let broker = fx.scheduler.metadata_broker();

    // Pending values have no metadata.
    fx.scheduler
        .commit(Transaction::new().put(
            rt_key("tap0", "10.0.0.0/24"),
            route_via("tap0", "10.0.0.0/24"),
        ))
        .unwrap();
    assert!(broker.lookup("route", &rt_key("tap0", "10.0.0.0/24")).is_none());

    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();
    let meta = broker
        .lookup("iface", &iface_key("tap0"))
        .expect("metadata for configured interface");
    let dpa_model::Metadata::Interface(meta) = &meta else {
        panic!("unexpected metadata kind");
    };
    let (indexed_key, _) = broker
        .lookup_by_index("iface", u64::from(meta.sw_if_index))
        .expect("secondary index entry");
    assert_eq!(indexed_key, iface_key("tap0"));

    fx.scheduler
        .commit(Transaction::new().delete(iface_key("tap0")))
        .unwrap();
    assert!(broker.lookup("iface", &iface_key("tap0")).is_none());
    assert!(
        broker
            .lookup_by_index("iface", u64::from(meta.sw_if_index))
            .is_none()
    );
}

#[test]
fn unowned_key_is_parked_as_unimplemented() {
    let mut fx = fixture();
    let key = Key::new("config/firewall/rule1").unwrap();
    let result = fx
        .scheduler
        .commit(Transaction::new().put(key.clone(), ConfigValue::Property))
        .unwrap();
    assert_eq!(result.outcome(&key), Some(&KeyOutcome::Unimplemented));
    assert_eq!(
        fx.scheduler.value_status(&key).unwrap().state,
        ValueState::Pending
    );
    assert!(fx.log.entries().is_empty());
}

#[test]
fn last_intent_per_key_wins_within_a_transaction() {
    let mut fx = fixture();
    let result = fx
        .scheduler
        .commit(
            Transaction::new()
                .put(iface_key("tap0"), tap_interface("tap0"))
                .delete(iface_key("tap0")),
        )
        .unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Unchanged));
    assert!(fx.backend.is_empty());
}

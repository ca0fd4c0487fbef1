//! Full-state reconciliation scenarios.

use std::sync::Arc;

use dpa_model::{ConfigValue, Key, KeyValuePair, keys};
use dpa_scheduler::test_support::{CallLog, MockBackend, MockDescriptor, route_via, tap_interface};
use dpa_scheduler::{
    Dependency, DescriptorRegistry, KVScheduler, KeyOutcome, MetadataBroker, SchedulerConfig,
    Transaction, ValueState,
};

fn iface_key(name: &str) -> Key {
    keys::interface_key(name).unwrap()
}

fn rt_key(iface: &str, dst: &str) -> Key {
    keys::route_key(iface, dst).unwrap()
}

struct Fixture {
    scheduler: KVScheduler,
    log: CallLog,
    backend: MockBackend,
    iface: Arc<MockDescriptor>,
}

fn fixture(cleanup_discovered: bool) -> Fixture {
    let log = CallLog::new();
    let backend = MockBackend::new();
    let mut iface = MockDescriptor::new(
        "iface",
        keys::INTERFACE_KEY_PREFIX,
        log.clone(),
        backend.clone(),
    )
    .with_metadata()
    .retrieving();
    if cleanup_discovered {
        iface = iface.cleaning_up_discovered();
    }
    let iface = Arc::new(iface);
    let route = Arc::new(
        MockDescriptor::new("route", keys::ROUTE_KEY_PREFIX, log.clone(), backend.clone())
            .retrieving()
            .with_retrieve_deps(&["iface"])
            .with_dependencies(|_key, value| match value {
                ConfigValue::Route(route) => vec![Dependency::on_key(
                    "interface exists",
                    keys::interface_key(&route.out_interface).unwrap(),
                )],
                _ => Vec::new(),
            }),
    );
    let mut registry = DescriptorRegistry::new();
    registry.register(iface.clone()).unwrap();
    registry.register(route).unwrap();
    let scheduler = KVScheduler::new(registry, MetadataBroker::new(), SchedulerConfig::default());
    Fixture {
        scheduler,
        log,
        backend,
        iface,
    }
}

fn declared_tap0() -> Vec<KeyValuePair> {
    vec![KeyValuePair::new(iface_key("tap0"), tap_interface("tap0"))]
}

#[test]
fn resync_creates_missing_values() {
    let mut fx = fixture(false);
    let result = fx.scheduler.resync(declared_tap0()).unwrap();

    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Created));
    assert!(fx.backend.contains(&iface_key("tap0")));
    assert!(result.skipped_retrievals.is_empty());
}

#[test]
fn resync_correlates_already_existing_values() {
    let mut fx = fixture(false);
    // The backend already holds the declared interface (e.g. the agent
    // restarted); resync must adopt it instead of re-creating.
    fx.backend
        .seed(iface_key("tap0"), tap_interface("tap0"), None);

    let result = fx.scheduler.resync(declared_tap0()).unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Unchanged));
    assert!(!fx.log.entries().iter().any(|e| e.starts_with("create:")));

    let status = fx.scheduler.value_status(&iface_key("tap0")).unwrap();
    assert_eq!(status.state, ValueState::Configured);
}

#[test]
fn resync_updates_divergent_values() {
    let mut fx = fixture(false);
    let mut drifted = tap_interface("tap0");
    if let ConfigValue::Interface(iface) = &mut drifted {
        iface.mtu = Some(1400);
    }
    fx.backend.seed(iface_key("tap0"), drifted, None);

    let result = fx.scheduler.resync(declared_tap0()).unwrap();
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Updated));
    assert!(fx.log.entries().contains(&"update:config/interface/tap0".to_string()));
}

#[test]
fn discovered_values_survive_unless_descriptor_opts_in() {
    // Default policy: a value discovered in the backend with no declared
    // counterpart stays.
    let mut fx = fixture(false);
    fx.backend
        .seed(iface_key("rogue"), tap_interface("rogue"), None);
    let result = fx.scheduler.resync(declared_tap0()).unwrap();
    assert!(result.outcome(&iface_key("rogue")).is_none());
    assert!(fx.backend.contains(&iface_key("rogue")));

    // With the descriptor opting in, the discovered leftover is removed.
    let mut fx = fixture(true);
    fx.backend
        .seed(iface_key("rogue"), tap_interface("rogue"), None);
    let result = fx.scheduler.resync(declared_tap0()).unwrap();
    assert_eq!(result.outcome(&iface_key("rogue")), Some(&KeyOutcome::Removed));
    assert!(!fx.backend.contains(&iface_key("rogue")));
}

#[test]
fn undeclared_northbound_values_are_removed() {
    let mut fx = fixture(false);
    fx.scheduler
        .commit(
            Transaction::new()
                .put(iface_key("tap0"), tap_interface("tap0"))
                .put(iface_key("tap1"), tap_interface("tap1")),
        )
        .unwrap();

    // The new declared set no longer contains tap1.
    let result = fx.scheduler.resync(declared_tap0()).unwrap();
    assert_eq!(result.outcome(&iface_key("tap1")), Some(&KeyOutcome::Removed));
    assert!(!fx.backend.contains(&iface_key("tap1")));
    assert!(fx.backend.contains(&iface_key("tap0")));
}

#[test]
fn resync_is_idempotent() {
    let mut fx = fixture(false);
    let declared = vec![
        KeyValuePair::new(iface_key("tap0"), tap_interface("tap0")),
        KeyValuePair::new(
            rt_key("tap0", "10.0.0.0/24"),
            route_via("tap0", "10.0.0.0/24"),
        ),
    ];
    fx.scheduler.resync(declared.clone()).unwrap();
    fx.log.take();

    let second = fx.scheduler.resync(declared).unwrap();
    assert!(second.is_noop(), "second resync outcomes: {:?}", second.outcomes);
    let mutations: Vec<String> = fx
        .log
        .entries()
        .into_iter()
        .filter(|e| !e.starts_with("retrieve:"))
        .collect();
    assert!(mutations.is_empty(), "unexpected backend calls: {mutations:?}");
}

#[test]
fn retrieval_failure_isolates_one_descriptor() {
    let mut fx = fixture(false);
    fx.scheduler
        .commit(Transaction::new().put(iface_key("tap0"), tap_interface("tap0")))
        .unwrap();

    fx.iface.fail_retrieve("dump timed out");
    let declared = vec![
        KeyValuePair::new(iface_key("tap0"), tap_interface("tap0")),
        KeyValuePair::new(
            rt_key("tap0", "10.0.0.0/24"),
            route_via("tap0", "10.0.0.0/24"),
        ),
    ];
    let result = fx.scheduler.resync(declared.clone()).unwrap();

    assert_eq!(result.skipped_retrievals.len(), 1);
    assert_eq!(result.skipped_retrievals[0].descriptor, "iface");
    // The failed descriptor's keys were not touched this pass...
    assert!(result.outcome(&iface_key("tap0")).is_none());
    // ...while the route was still reconciled (its interface dependency is
    // satisfied by the previously configured value).
    assert_eq!(
        result.outcome(&rt_key("tap0", "10.0.0.0/24")),
        Some(&KeyOutcome::Created)
    );

    // Once retrieval heals, the next resync covers everything again.
    fx.iface.heal_retrieve();
    let result = fx.scheduler.resync(declared).unwrap();
    assert!(result.skipped_retrievals.is_empty());
    assert_eq!(result.outcome(&iface_key("tap0")), Some(&KeyOutcome::Unchanged));
}

#[test]
fn retrieve_runs_in_declared_dependency_order() {
    let mut fx = fixture(false);
    fx.scheduler.resync(declared_tap0()).unwrap();

    let entries = fx.log.entries();
    let iface_retrieve = entries
        .iter()
        .position(|e| e.starts_with("retrieve:config/interface/"))
        .expect("iface retrieved");
    let route_retrieve = entries
        .iter()
        .position(|e| e.starts_with("retrieve:config/route/"))
        .expect("route retrieved");
    assert!(iface_retrieve < route_retrieve, "entries: {entries:?}");
}

#[test]
fn resync_rebuilds_metadata_from_retrieval() {
    let mut fx = fixture(false);
    let meta = dpa_model::Metadata::Interface(dpa_model::InterfaceMeta {
        sw_if_index: 42,
        os_if_index: Some(7),
        namespace: None,
    });
    fx.backend
        .seed(iface_key("tap0"), tap_interface("tap0"), Some(meta.clone()));

    // Fresh scheduler: in-memory state is empty, everything comes from
    // retrieval.
    fx.scheduler.resync(declared_tap0()).unwrap();
    let broker = fx.scheduler.metadata_broker();
    assert_eq!(broker.lookup("iface", &iface_key("tap0")), Some(meta));
    let (key, _) = broker.lookup_by_index("iface", 42).expect("index rebuilt");
    assert_eq!(key, iface_key("tap0"));
}

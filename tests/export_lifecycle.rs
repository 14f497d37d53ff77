mod support;

use std::sync::Arc;

use beacon::{
    Codec, CreateMode, JsonCodec, MemoryStore, RegistryConfig, Service, ServiceOverrides,
};
use support::{registry, registry_with, RecordingListener, ScriptedStore};

fn orders() -> Service {
    Service::new("com.acme.Orders", "1.0")
}

#[test]
fn export_then_logout_leaves_nothing_behind() -> beacon::Result<()> {
    let store = MemoryStore::new();
    let reg = registry(Arc::new(store.session()), RecordingListener::new(), "10.0.0.1:7000");
    reg.ready()?;
    let baseline = store.node_count();

    assert!(reg.export(orders(), Arc::new("orders-handler"))?);
    assert!(reg.export(orders(), Arc::new("orders-handler"))?);
    let dir = "/beacon/com.acme.Orders/1.0";
    assert_eq!(store.children(dir), vec!["0000000000", "0000000001"]);
    assert_eq!(reg.published(&orders()).len(), 2);
    assert_eq!(reg.services(), vec![orders()]);

    let handler = reg.logout(&orders()).expect("handler recorded");
    assert_eq!(handler.downcast_ref::<&str>(), Some(&"orders-handler"));
    assert!(store.children(dir).is_empty());
    assert!(reg.instances().is_empty());
    assert!(reg.services().is_empty());
    assert!(reg.handler(&orders()).is_none());
    // Only the persistent directories created for the export remain.
    assert_eq!(store.node_count(), baseline + 2);

    // Logging out twice is harmless.
    assert!(reg.logout(&orders()).is_none());
    Ok(())
}

#[test]
fn exports_wait_for_readiness() -> beacon::Result<()> {
    let store = MemoryStore::new();
    let scripted = ScriptedStore::new(Arc::new(store.session()));
    let reg = registry(scripted.clone(), RecordingListener::new(), "10.0.0.1:7000");

    assert!(!reg.export(orders(), Arc::new(()))?);
    assert!(scripted.creates(CreateMode::EphemeralSequential).is_empty());
    assert!(!reg.is_ready());
    assert_eq!(reg.deferred_exports(), 1);

    reg.ready()?;
    assert_eq!(scripted.creates(CreateMode::EphemeralSequential).len(), 1);
    assert!(reg.status_path().is_some());
    assert!(reg.config_path().is_some());

    // A second readiness signal publishes nothing new.
    reg.ready()?;
    assert_eq!(scripted.creates(CreateMode::EphemeralSequential).len(), 1);

    assert!(reg.export(Service::new("com.acme.Billing", "2.1"), Arc::new(()))?);
    assert_eq!(scripted.creates(CreateMode::EphemeralSequential).len(), 2);
    Ok(())
}

#[test]
fn concurrent_first_exports_share_one_list() -> beacon::Result<()> {
    let store = MemoryStore::new();
    let reg = registry(Arc::new(store.session()), RecordingListener::new(), "10.0.0.1:7000");
    reg.ready()?;

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| reg.export(orders(), Arc::new(())).unwrap());
        }
    });

    assert_eq!(reg.published(&orders()).len(), 2);
    assert_eq!(store.children("/beacon/com.acme.Orders/1.0").len(), 2);
    Ok(())
}

#[test]
fn demote_continues_past_failed_nodes() -> beacon::Result<()> {
    let store = MemoryStore::new();
    let scripted = ScriptedStore::new(Arc::new(store.session()));
    let reg = registry(scripted.clone(), RecordingListener::new(), "10.0.0.1:7000");
    reg.ready()?;

    let services = [
        Service::new("a", "1"),
        Service::new("b", "1"),
        Service::new("c", "1"),
    ];
    for service in &services {
        reg.export(service.clone(), Arc::new(()))?;
    }
    let broken = reg.published(&services[1])[0].path.clone();
    scripted.fail_writes_to(&broken);

    let report = reg.demote();
    assert_eq!(report.demoted.len(), 2);
    assert_eq!(report.failed, vec![broken.clone()]);

    for service in [&services[0], &services[2]] {
        let path = &reg.published(service)[0].path;
        let stored = JsonCodec.decode_instance(&store.data(path).unwrap())?;
        assert_eq!(stored.host.priority, 0);
    }
    let untouched = JsonCodec.decode_instance(&store.data(&broken).unwrap())?;
    assert!(!untouched.host.is_demoted());
    Ok(())
}

#[test]
fn per_service_overrides_shape_the_exported_host() -> beacon::Result<()> {
    let mut config = RegistryConfig {
        default_tag: "blue".to_string(),
        ..RegistryConfig::default()
    };
    config.services.insert(
        "com.acme.Orders".to_string(),
        ServiceOverrides {
            tag: Some("canary".to_string()),
            priority: Some(9),
            ..ServiceOverrides::default()
        },
    );
    config.services.insert(
        "com.acme.Hidden".to_string(),
        ServiceOverrides {
            export: Some(false),
            ..ServiceOverrides::default()
        },
    );
    let store = MemoryStore::new();
    let reg = registry_with(
        Arc::new(store.session()),
        RecordingListener::new(),
        "10.0.0.1:7000",
        config,
    );
    reg.ready()?;

    reg.export(orders(), Arc::new(()))?;
    reg.export(Service::new("com.acme.Billing", "1"), Arc::new(()))?;
    reg.export(Service::new("com.acme.Hidden", "1"), Arc::new(()))?;

    let hosts: Vec<(String, String, u32)> = reg
        .instances()
        .into_iter()
        .map(|i| (i.service.name, i.host.tag, i.host.priority))
        .collect();
    assert_eq!(
        hosts,
        vec![
            ("com.acme.Billing".to_string(), "blue".to_string(), 5),
            ("com.acme.Orders".to_string(), "canary".to_string(), 9),
        ]
    );
    assert!(store.children("/beacon/com.acme.Hidden/1").is_empty());
    Ok(())
}

#[test]
fn shutdown_withdraws_every_ephemeral_node() -> beacon::Result<()> {
    let store = MemoryStore::new();
    let reg = registry(Arc::new(store.session()), RecordingListener::new(), "10.0.0.1:7000");
    reg.start()?;
    reg.export(orders(), Arc::new(()))?;
    reg.ready()?;
    assert_eq!(store.children("/beacon/_status").len(), 1);

    reg.shutdown();
    assert!(store.children("/beacon/com.acme.Orders/1.0").is_empty());
    assert!(store.children("/beacon/_status").is_empty());
    assert!(store.children("/beacon/_config").is_empty());
    Ok(())
}

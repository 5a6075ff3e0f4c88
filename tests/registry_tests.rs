mod common;

use common::{write_chart, SHOP};
use ftl::registry::{ChartId, RegistryStore};
use ftl::Error;
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use std::thread;

#[test]
fn register_then_resolve_by_path_and_id() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_chart(dir.path(), "shop", SHOP);
    let store = RegistryStore::new(dir.path().join("home"));

    let chart = store.register(&root).unwrap();
    let registry = store.read().unwrap();

    let by_path = registry.resolve(root.to_str().unwrap()).unwrap();
    assert_eq!(by_path.root, chart.root);
    assert_eq!(registry.resolve(chart.id.as_str()).unwrap(), &chart);
    assert_eq!(chart.id, ChartId::for_path(&chart.root));
    assert_eq!(chart.manifest, chart.root.join("ftl.yaml"));
}

#[test]
fn remove_then_resolve_is_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_chart(dir.path(), "shop", SHOP);
    let store = RegistryStore::new(dir.path().join("home"));
    let chart = store.register(&root).unwrap();
    store.set_active_profile(&chart.id, "db").unwrap();

    let removed = store.remove(chart.id.as_str()).unwrap();
    assert_eq!(removed.map(|c| c.id), Some(chart.id.clone()));

    let registry = store.read().unwrap();
    assert!(matches!(registry.resolve(chart.id.as_str()), Err(Error::UnknownChart(_))));
    assert!(registry.active_profile(&chart.id).is_none());
    drop(registry);

    assert!(matches!(store.remove(chart.id.as_str()), Err(Error::UnknownChart(_))));
}

#[test]
fn list_keeps_registration_order_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    let a = write_chart(dir.path(), "alpha", SHOP);
    let b = write_chart(dir.path(), "beta", SHOP);
    let c = write_chart(dir.path(), "gamma", SHOP);

    let store = RegistryStore::new(&home);
    for root in [&b, &a, &c] {
        store.register(root).unwrap();
    }

    let reopened = RegistryStore::new(&home);
    let registry = reopened.read().unwrap();
    let names: Vec<String> = registry
        .list()
        .iter()
        .map(|c| c.root.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, ["beta", "alpha", "gamma"]);
    assert_eq!(registry.home().unwrap().root.file_name().unwrap(), "gamma");
}

#[test]
fn duplicate_registration_leaves_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_chart(dir.path(), "shop", SHOP);
    let store = RegistryStore::new(dir.path().join("home"));
    store.register(&root).unwrap();
    let before = fs::read_to_string(store.path()).unwrap();

    assert!(matches!(store.register(&root), Err(Error::DuplicateChart { .. })));
    assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
}

#[test]
fn newer_format_is_reported_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = RegistryStore::new(dir.path());
    fs::write(store.path(), r#"{"version": 99, "charts": []}"#).unwrap();
    assert!(matches!(store.read(), Err(Error::RegistryCorrupt { .. })));
}

#[test]
fn concurrent_registrations_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RegistryStore::new(dir.path().join("home")));
    let roots: Vec<_> = (0..8)
        .map(|i| write_chart(dir.path(), &format!("proj{i}"), SHOP))
        .collect();

    let handles: Vec<_> = roots
        .into_iter()
        .map(|root| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.register(&root).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.read().unwrap().list().len(), 8);
}

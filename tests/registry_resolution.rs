//! Bootstrap policy, cross-package resolution and redirectors

mod common;

use common::{client, content};
use gpk_rs::core::composite::encrypt;
use gpk_rs::{
    Engine, ErrorKind, FormatVersion, GpkError, PackageBuilder, PackageRegistry, PropertyValue,
    Variant,
};
use std::sync::Arc;

fn engine(client: &common::Client) -> Engine {
    Engine::new(client.config()).unwrap()
}

#[test]
fn test_bootstrap_builds_class_chains() {
    let client = client(Variant::Legacy);
    let engine = engine(&client);
    let tree = engine.bootstrap().unwrap();

    assert_eq!(tree.chain("S1Pawn"), Some("Object.Actor.GamePawn.S1Pawn"));
    assert_eq!(tree.chain("light"), Some("Object.Actor.Light"));
    assert!(tree.is_a("S1Pawn", "actor"));
    assert!(!tree.is_a("S1Thing", "Actor"));

    let classes = engine.classes().unwrap();
    let pawn = classes.iter().find(|c| c.name == "S1Pawn").unwrap();
    assert_eq!(pawn.package, "S1Game");
    assert_eq!(pawn.super_name.as_deref(), Some("GamePawn"));
}

#[test]
fn test_missing_essential_class_package_is_fatal() {
    let client = client(Variant::Legacy);
    std::fs::remove_file(client.cooked().join("GameFramework.gpk")).unwrap();
    let engine = engine(&client);

    let err = engine.bootstrap().unwrap_err();
    assert!(matches!(&err, GpkError::MissingClassPackage(name) if name == "GameFramework"), "{}", err);
    assert!(err.is_fatal_at_startup());
    assert!(!engine.registry().is_bootstrapped());
    // Nothing stays retained after a failed bootstrap
    assert_eq!(engine.registry().live_count(), 0);
}

#[test]
fn test_missing_extra_class_package_is_skipped() {
    let client = client(Variant::Legacy);
    let mut config = client.config();
    config.extra_class_packages = Some(vec!["GFxUI".into(), "Content".into()]);
    content(&client);
    let engine = Engine::new(config).unwrap();

    engine.bootstrap().unwrap();
    // Four essential packages plus `Content`
    assert_eq!(engine.registry().live_count(), 5);
}

#[test]
fn test_modern_client_requires_mapper_files() {
    let client = client(Variant::Modern);
    let err = engine(&client).bootstrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingDependency);
}

#[test]
fn test_resolution_before_bootstrap_is_refused() {
    let client = client(Variant::Legacy);
    content(&client);
    let err = engine(&client).resolve("Content.Real").unwrap_err();
    assert!(matches!(err, GpkError::NotBootstrapped));
}

#[test]
fn test_resolves_and_loads_across_packages() {
    let client = client(Variant::Legacy);
    content(&client);
    let engine = engine(&client);
    engine.bootstrap().unwrap();

    let real = engine.load_object("Content.Real").unwrap();
    assert_eq!(real.object.path().unwrap(), "Real");
    assert_eq!(real.package.name(), "Content");

    // The import was followed into `Other`
    let last = engine.resolve("Other.Final").unwrap();
    assert!(last.object.is_ready());
    let body = last.object.body().unwrap();
    assert_eq!(body.tags[0].value, PropertyValue::Int(7));
}

#[test]
fn test_redirector_single_hop() {
    let client = client(Variant::Legacy);
    content(&client);
    let engine = engine(&client);
    engine.bootstrap().unwrap();

    let via_export = engine.resolve("Content.Old").unwrap();
    assert_eq!(via_export.object.path().unwrap(), "Real");

    let via_import = engine.resolve("Content.Far").unwrap();
    assert_eq!(via_import.package.name(), "Other");
    assert_eq!(via_import.object.path().unwrap(), "Final");
}

#[test]
fn test_redirector_to_redirector_is_corruption() {
    let client = client(Variant::Legacy);
    content(&client);
    let engine = engine(&client);
    engine.bootstrap().unwrap();

    let err = engine.resolve("Content.Chain").unwrap_err();
    assert!(matches!(err, GpkError::RedirectorChain { .. }), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_redirector_mapper_file() {
    let client = client(Variant::Legacy);
    content(&client);
    client.write_redirectors(&[
        ("Gone.Thing", "Content.Real"),
        ("Gone.Twice", "Content.Old"),
    ]);
    let engine = engine(&client);
    engine.bootstrap().unwrap();

    let moved = engine.resolve("gone.thing").unwrap();
    assert_eq!(moved.object.path().unwrap(), "Real");

    // The mapping already used the one allowed hop
    let err = engine.resolve("Gone.Twice").unwrap_err();
    assert!(matches!(err, GpkError::RedirectorChain { .. }), "{}", err);
}

#[test]
fn test_missing_object_and_package() {
    let client = client(Variant::Legacy);
    content(&client);
    let engine = engine(&client);
    engine.bootstrap().unwrap();

    assert!(matches!(engine.resolve("Content.Nope"), Err(GpkError::MissingObject(_))));
    assert!(matches!(engine.resolve("Nowhere.Thing"), Err(GpkError::MissingPackage(_))));
}

#[test]
fn test_concurrent_opens_share_one_instance() {
    let client = client(Variant::Legacy);
    content(&client);
    let registry = Arc::new(PackageRegistry::new(client.config()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let handle = registry.open_by_name("Content", false).unwrap();
                let object = handle.get_object("Real").unwrap();
                object.load().unwrap();
                let ptr = Arc::as_ptr(handle.package()) as usize;
                registry.release(handle);
                ptr
            })
        })
        .collect();
    let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(pointers.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn test_retain_tokens_are_counted() {
    let client = client(Variant::Legacy);
    content(&client);
    let registry = PackageRegistry::new(client.config()).unwrap();

    let first = registry.open_by_name("Content", false).unwrap();
    let second = registry.retain(&first);
    assert_eq!(registry.retain_count(&first), 2);
    registry.release(second);
    assert_eq!(registry.retain_count(&first), 1);
    registry.release(first);
    assert_eq!(registry.live_count(), 0);
    assert_eq!(registry.released_count(), 1);
    assert_eq!(registry.collect_garbage(), 1);
}

#[test]
fn test_resolved_package_outlives_lru_eviction() {
    let client = client(Variant::Legacy);
    content(&client);
    let mut config = client.config();
    config.released_cache_capacity = 1;
    let engine = Engine::new(config).unwrap();
    engine.bootstrap().unwrap();

    let first = engine.resolve("Content.Real").unwrap();
    // Releasing `Other` pushes `Content` out of the one-slot LRU
    engine.resolve("Other.Final").unwrap();
    let second = engine.resolve("Content.Real").unwrap();

    assert!(Arc::ptr_eq(&first.package, &second.package));
    assert!(Arc::ptr_eq(&first.object, &second.object));
}

#[test]
fn test_malformed_mapper_fails_bootstrap() {
    let client = client(Variant::Legacy);
    content(&client);
    // Entry without its closing `|`
    std::fs::write(
        client.cooked().join("ObjectRedirectorMapper.dat"),
        encrypt(b"Gone.Thing,Content.Real"),
    )
    .unwrap();
    let engine = engine(&client);

    let err = engine.bootstrap().unwrap_err();
    assert!(matches!(err, GpkError::IndexGrammar { .. }), "{}", err);
    assert!(err.is_fatal_at_startup());
    assert!(!engine.registry().is_bootstrapped());
    assert!(matches!(engine.resolve("Content.Real"), Err(GpkError::NotBootstrapped)));
}

#[test]
fn test_cyclic_class_hierarchy_fails_bootstrap() {
    let client = client(Variant::Legacy);
    // GamePawn now derives from S1Pawn, which derives from GamePawn
    let mut framework = PackageBuilder::new(FormatVersion::Legacy);
    let pawn = framework
        .import_object("S1Game.S1Pawn", "Core", "Class")
        .unwrap();
    framework.class("GamePawn", pawn).unwrap();
    client.write("GameFramework", &framework);
    let engine = engine(&client);

    let err = engine.bootstrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption, "{}", err);
    assert!(!engine.registry().is_bootstrapped());
    assert_eq!(engine.registry().live_count(), 0);
}

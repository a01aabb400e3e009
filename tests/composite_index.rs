//! Composite bundles end to end: slices, mapper files and patching

mod common;

use common::{client, storage_file, thing_package};
use gpk_rs::core::composite::{decrypt, encrypt};
use gpk_rs::{
    CancellationFlag, CompositeIndex, Engine, ErrorKind, GpkError, IndexPatcher, NullProgress,
    PackageNameIndex, PatchEntry, PropertyValue, Variant,
};
use proptest::prelude::*;

const PLAIN: &[u8] = b"S1Data_0?PkgA,comp_a,100,200,|PkgB,comp_b,300,50,|!S1Data_1?PkgC,comp_c,0,9000,|!";

proptest! {
    #[test]
    fn prop_cipher_round_trip(data in prop::collection::vec(any::<u8>(), 0..600)) {
        prop_assert_eq!(decrypt(&encrypt(&data)), data);
    }

    #[test]
    fn prop_patch_is_idempotent(offset in 0u64..1_000_000, size in 1u64..1_000_000, target in 0usize..3) {
        let filename = ["S1Data_0", "S1Data_1", "S1Data_9"][target];
        let entry = PatchEntry {
            filename: filename.to_string(),
            object_path: "PkgB".to_string(),
            offset,
            size,
        };
        let mut once = IndexPatcher::new(PLAIN.to_vec()).unwrap();
        once.patch("comp_b", &entry).unwrap();
        let mut twice = once.clone();
        twice.patch("comp_b", &entry).unwrap();
        prop_assert_eq!(once.plaintext(), twice.plaintext());

        let index = once.index().unwrap();
        let found = index.find("comp_b").unwrap();
        prop_assert_eq!(&found.filename, filename);
        prop_assert_eq!((found.offset, found.size), (offset, size));
        prop_assert_eq!(index.len(), 3);
    }
}

#[test]
fn test_relocation_keeps_other_entries() {
    let mut patcher = IndexPatcher::new(PLAIN.to_vec()).unwrap();
    patcher
        .patch(
            "comp_a",
            &PatchEntry {
                filename: "S1Data_1".into(),
                object_path: "PkgA".into(),
                offset: 4096,
                size: 128,
            },
        )
        .unwrap();
    let index = patcher.index().unwrap();
    assert_eq!(index.sections().len(), 2);
    assert_eq!(index.find("comp_a").unwrap().filename, "S1Data_1");
    assert_eq!(index.find("comp_b").unwrap().offset, 300);
    assert_eq!(index.find("comp_c").unwrap().size, 9000);

    let err = patcher.delete_entry("comp_zz").unwrap_err();
    assert!(matches!(err, GpkError::PatchTargetNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::IndexLogic);
}

#[test]
fn test_mapper_file_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("CompositePackageMapper.dat");
    std::fs::write(&path, encrypt(PLAIN)).unwrap();

    let mut patcher = IndexPatcher::load(&path).unwrap();
    patcher.delete_entry("comp_c").unwrap();
    patcher.apply_to(&path).unwrap();

    let index = CompositeIndex::load(&path).unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!(index.sections().len(), 1);
    assert!(index.find("comp_c").is_none());
}

/// Modern client with two slices packed into one storage file
fn packed_client() -> (common::Client, CompositeIndex) {
    let client = client(Variant::Modern);
    let section = storage_file(
        &client,
        "S1Data_0",
        &[
            ("PkgA", "comp_a", thing_package(Variant::Modern, "PkgA", 1)),
            ("PkgB", "comp_b", thing_package(Variant::Modern, "PkgB", 2)),
        ],
    );
    let index = CompositeIndex::from_sections(vec![section]);
    client.write_composites(&index);
    client.write_package_names(&[("PkgA.Thing", "comp_a.Thing")]);
    client.write_redirectors(&[]);
    (client, index)
}

#[test]
fn test_slices_open_at_their_boundaries() {
    let (client, _) = packed_client();
    let engine = Engine::new(client.config()).unwrap();
    engine.bootstrap().unwrap();

    for (name, value) in [("PkgA", 1), ("PkgB", 2)] {
        let resolved = engine.load_object(&format!("{}.Thing", name)).unwrap();
        assert!(resolved.package.is_composite());
        assert_eq!(resolved.package.name(), name);
        let body = resolved.object.body().unwrap();
        assert_eq!(body.tags[0].value, PropertyValue::Int(value));
    }

    let handle = engine.registry().open_composite_by_name("comp_b").unwrap();
    assert_eq!(handle.name(), "PkgB");
    engine.release(handle);

    assert_eq!(engine.composite_names().unwrap(), vec!["comp_a", "comp_b"]);
    assert_eq!(engine.find_composites("^COMP_B$").unwrap(), vec!["comp_b"]);
    assert!(matches!(engine.find_composites("("), Err(GpkError::Config(_))));
}

#[test]
fn test_slice_past_end_of_storage_is_corruption() {
    let (client, index) = packed_client();
    let mut entry = index.find("comp_b").unwrap().clone();
    entry.offset += 1_000_000;
    let engine = Engine::new(client.config()).unwrap();
    let err = engine.registry().open_composite(&entry).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption, "{}", err);
}

#[test]
fn test_patch_through_engine_moves_slice() {
    let (client, index) = packed_client();
    let engine = Engine::new(client.config()).unwrap();
    let b = index.find("comp_b").unwrap().clone();
    let a = index.find("comp_a").unwrap().clone();

    // Point comp_b at PkgA's bytes
    engine
        .patch_composite_index(
            "comp_b",
            &PatchEntry {
                filename: a.filename.clone(),
                object_path: b.object_path.clone(),
                offset: a.offset,
                size: a.size,
            },
        )
        .unwrap();
    engine.bootstrap().unwrap();
    let handle = engine.registry().open_composite_by_name("comp_b").unwrap();
    let thing = handle.get_object("Thing").unwrap();
    thing.load().unwrap();
    assert_eq!(thing.body().unwrap().tags[0].value, PropertyValue::Int(1));
    engine.release(handle);
}

#[test]
fn test_unpack_and_rebuild_package_names() {
    let (client, _) = packed_client();
    let engine = Engine::new(client.config()).unwrap();
    engine.bootstrap().unwrap();

    let out = tempfile::tempdir().unwrap();
    let report = engine
        .unpack_composites(out.path(), &CancellationFlag::new(), &NullProgress)
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.output.len(), 2);
    assert!(out.path().join("comp_a.gpk").exists());

    let report = engine
        .rebuild_package_names(&CancellationFlag::new(), &NullProgress)
        .unwrap();
    assert!(report.is_clean());
    let names = PackageNameIndex::load(client.cooked().join("PkgMapper.dat")).unwrap();
    assert_eq!(names.resolve("PkgB.Thing"), Some("comp_b.Thing"));
    assert_eq!(names.composite_for_package("pkga"), Some("comp_a"));
}

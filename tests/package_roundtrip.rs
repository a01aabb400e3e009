//! Package write/read round trips
//!
//! Every fixture is authored with `PackageBuilder`, written out, and read
//! back through `Package`.

use gpk_rs::core::property::{find_tag, StructValue};
use gpk_rs::{
    FormatVersion, LoadOptions, Package, PackageBuilder, PackageIndex, PropertyTag, PropertyType,
    PropertyValue,
};
use std::sync::Arc;

/// `Root` package with a `Group.Thing` export carrying a few tags
fn sample(version: FormatVersion) -> PackageBuilder {
    let mut builder = PackageBuilder::new(version);
    let root = builder
        .object("Core", "Package", PackageIndex::NULL, "Group")
        .unwrap();
    let thing = builder.object("S1Game", "S1Thing", root, "Thing").unwrap();
    let tags = vec![
        builder.tag("Health", PropertyType::Int, PropertyValue::Int(250)),
        builder.tag("Scale", PropertyType::Float, PropertyValue::Float(1.5)),
        builder.tag("bHidden", PropertyType::Bool, PropertyValue::Bool(true)),
        builder.tag("Label", PropertyType::Str, PropertyValue::Str("crate".into())),
        builder.tag("Owner", PropertyType::Object, PropertyValue::Object(root)),
    ];
    builder.set_tags(thing, tags).unwrap();
    builder
}

fn open(builder: &PackageBuilder) -> Arc<Package> {
    builder.open("Sample", LoadOptions::default()).unwrap()
}

#[test]
fn test_directory_bytes_are_stable_across_reopen() {
    for version in [FormatVersion::Legacy, FormatVersion::Modern] {
        let bytes = sample(version).build().unwrap();
        let package = Package::from_bytes("Sample", bytes.clone(), LoadOptions::default()).unwrap();
        let directory = package.directory_bytes().unwrap();
        assert_eq!(
            &bytes[..directory.len()],
            &directory[..],
            "{} directory differs from the written image",
            version
        );
    }
}

#[test]
fn test_unmodified_save_is_byte_identical() {
    for version in [FormatVersion::Legacy, FormatVersion::Modern] {
        let bytes = sample(version).build().unwrap();
        let package = Package::from_bytes("Sample", bytes.clone(), LoadOptions::default()).unwrap();
        assert_eq!(package.to_bytes().unwrap(), bytes);
    }
}

#[test]
fn test_properties_survive_reopen() {
    for version in [FormatVersion::Legacy, FormatVersion::Modern] {
        let package = open(&sample(version));
        let thing = package.get_object("Group.Thing").unwrap();
        assert!(!thing.is_ready());
        thing.load().unwrap();
        assert!(thing.is_ready());

        let body = thing.body().unwrap();
        let names = package.names();
        let int = |name: &str| find_tag(&body.tags, &names, name).map(|t| t.value.clone());
        assert_eq!(int("Health"), Some(PropertyValue::Int(250)));
        assert_eq!(int("scale"), Some(PropertyValue::Float(1.5)));
        assert_eq!(int("bHidden"), Some(PropertyValue::Bool(true)));
        assert_eq!(int("Label"), Some(PropertyValue::Str("crate".into())));
        assert_eq!(int("Owner"), Some(PropertyValue::Object(PackageIndex(1))));
    }
}

#[test]
fn test_save_after_edit_reencodes_object() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Sample.gpk");
    sample(FormatVersion::Modern).write_to(&path).unwrap();

    let package = Package::open(&path, LoadOptions::default()).unwrap();
    let thing = package.get_object("Group.Thing").unwrap();
    thing.load().unwrap();
    thing
        .update(|body| {
            for tag in &mut body.tags {
                if tag.value == PropertyValue::Int(250) {
                    tag.value = PropertyValue::Int(9000);
                }
            }
        })
        .unwrap();
    assert!(package.is_dirty(thing.index()).unwrap());

    let out = dir.path().join("Edited.gpk");
    package.save(&out).unwrap();
    assert!(!package.is_dirty(thing.index()).unwrap());

    let reopened = Package::open(&out, LoadOptions::default()).unwrap();
    let thing = reopened.get_object("Group.Thing").unwrap();
    thing.load().unwrap();
    let body = thing.body().unwrap();
    let names = reopened.names();
    assert_eq!(
        find_tag(&body.tags, &names, "Health").map(|t| &t.value),
        Some(&PropertyValue::Int(9000))
    );
    assert_eq!(
        find_tag(&body.tags, &names, "Label").map(|t| &t.value),
        Some(&PropertyValue::Str("crate".into()))
    );
}

#[test]
fn test_compressed_package_opens_like_plain() {
    for version in [FormatVersion::Legacy, FormatVersion::Modern] {
        let plain = open(&sample(version));
        let compressed = open(&sample(version).compressed(true));
        assert!(compressed.summary().is_compressed());
        assert_eq!(plain.export_count(), compressed.export_count());

        let a = plain.object_json(PackageIndex(2)).unwrap();
        let b = compressed.object_json(PackageIndex(2)).unwrap();
        assert_eq!(a, b);

        // Saving always writes an uncompressed image
        let saved = Package::from_bytes("Resaved", compressed.to_bytes().unwrap(), LoadOptions::default())
            .unwrap();
        assert!(!saved.summary().is_compressed());
        assert_eq!(saved.object_json(PackageIndex(2)).unwrap(), a);
    }
}

#[test]
fn test_rename_and_reparent_persist() {
    let package = open(&sample(FormatVersion::Legacy));
    let thing = package.get_object("Group.Thing").unwrap().index();
    package.rename_export(thing, "Renamed").unwrap();
    package.reparent_export(thing, PackageIndex::NULL).unwrap();

    let reopened = Package::from_bytes("Sample", package.to_bytes().unwrap(), LoadOptions::default()).unwrap();
    assert!(reopened.get_object("Renamed").is_ok());
    assert!(reopened.get_object("Group.Thing").is_err());
    assert_eq!(reopened.object_path(thing).unwrap(), "Renamed");
}

#[test]
fn test_reparent_rejects_cycle() {
    let package = open(&sample(FormatVersion::Legacy));
    let group = PackageIndex(1);
    let thing = package.get_object("Group.Thing").unwrap().index();
    assert!(package.reparent_export(group, thing).is_err());
    assert_eq!(package.object_path(thing).unwrap(), "Group.Thing");
}

#[test]
fn test_convert_to_redirector() {
    let mut builder = sample(FormatVersion::Modern);
    let spare = builder
        .object("S1Game", "S1Thing", PackageIndex::NULL, "Spare")
        .unwrap();
    let package = open(&builder);
    let thing = package.get_object("Group.Thing").unwrap().index();
    package.convert_to_redirector(spare, thing).unwrap();
    assert_eq!(package.redirector_target(spare).unwrap(), thing);

    let reopened = Package::from_bytes("Sample", package.to_bytes().unwrap(), LoadOptions::default()).unwrap();
    assert_eq!(reopened.class_name(spare).unwrap(), "ObjectRedirector");
    assert_eq!(reopened.redirector_target(spare).unwrap(), thing);
}

#[test]
fn test_nested_struct_round_trip() {
    let mut builder = PackageBuilder::new(FormatVersion::Modern);
    let holder = builder
        .object("S1Game", "S1Holder", PackageIndex::NULL, "Holder")
        .unwrap();
    let inner = vec![builder.tag("Depth", PropertyType::Int, PropertyValue::Int(2))];
    let outer = PropertyTag::new_struct(builder.names_mut(), "Inner", "S1Inner", StructValue::Tagged(inner));
    let tag = PropertyTag::new_struct(
        builder.names_mut(),
        "Outer",
        "S1Outer",
        StructValue::Tagged(vec![outer]),
    );
    builder.set_tags(holder, vec![tag]).unwrap();

    let package = open(&builder);
    let object = package.get_object("Holder").unwrap();
    object.load().unwrap();
    let body = object.body().unwrap();
    assert_eq!(body.tags.len(), 1);
    let PropertyValue::Struct(StructValue::Tagged(outer)) = &body.tags[0].value else {
        panic!("expected a tagged struct, got {:?}", body.tags[0].value);
    };
    let PropertyValue::Struct(StructValue::Tagged(inner)) = &outer[0].value else {
        panic!("expected a nested tagged struct, got {:?}", outer[0].value);
    };
    assert_eq!(inner[0].value, PropertyValue::Int(2));
}

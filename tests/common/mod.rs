//! On-disk client fixtures shared by the registry tests

#![allow(dead_code)]

use gpk_rs::core::composite::CompositeSection;
use gpk_rs::core::mapper::KeyValueIndex;
use gpk_rs::{
    CompositeEntry, CompositeIndex, EngineConfig, FormatVersion, PackageBuilder, PackageIndex,
    PropertyType, PropertyValue, Variant,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Client {
    pub dir: TempDir,
    pub variant: Variant,
}

impl Client {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn cooked(&self) -> PathBuf {
        self.root().join("CookedPC")
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.root());
        config.variant = self.variant;
        config
    }

    pub fn write(&self, name: &str, builder: &PackageBuilder) {
        builder.write_to(self.cooked().join(format!("{}.gpk", name))).unwrap();
    }

    pub fn write_redirectors(&self, pairs: &[(&str, &str)]) {
        let mut map = KeyValueIndex::new();
        for (from, to) in pairs {
            map.insert(from.to_string(), to.to_string());
        }
        map.save(self.cooked().join("ObjectRedirectorMapper.dat")).unwrap();
    }

    pub fn write_package_names(&self, pairs: &[(&str, &str)]) {
        let mut map = KeyValueIndex::new();
        for (from, to) in pairs {
            map.insert(from.to_string(), to.to_string());
        }
        map.save(self.cooked().join("PkgMapper.dat")).unwrap();
    }

    pub fn write_composites(&self, index: &CompositeIndex) {
        std::fs::write(
            self.cooked().join("CompositePackageMapper.dat"),
            index.to_encrypted().unwrap(),
        )
        .unwrap();
    }
}

fn version(variant: Variant) -> FormatVersion {
    variant.format_version()
}

/// Core, Engine, GameFramework and S1Game with a small class hierarchy
pub fn client(variant: Variant) -> Client {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("CookedPC")).unwrap();
    let client = Client { dir, variant };
    let v = version(variant);

    let mut core = PackageBuilder::new(v);
    let object = core.class("Object", PackageIndex::NULL).unwrap();
    core.class("Package", object).unwrap();
    core.class("ObjectRedirector", object).unwrap();
    client.write("Core", &core);

    let mut engine = PackageBuilder::new(v);
    let object = engine.import_object("Core.Object", "Core", "Class").unwrap();
    let actor = engine.class("Actor", object).unwrap();
    engine.class("Light", actor).unwrap();
    client.write("Engine", &engine);

    let mut framework = PackageBuilder::new(v);
    let actor = framework.import_object("Engine.Actor", "Core", "Class").unwrap();
    framework.class("GamePawn", actor).unwrap();
    client.write("GameFramework", &framework);

    let mut game = PackageBuilder::new(v);
    let pawn = game.import_object("GameFramework.GamePawn", "Core", "Class").unwrap();
    game.class("S1Pawn", pawn).unwrap();
    let object = game.import_object("Core.Object", "Core", "Class").unwrap();
    game.class("S1Thing", object).unwrap();
    client.write("S1Game", &game);

    client
}

/// `Content` holds `Real`, redirectors `Old` (to `Real`), `Far` (to
/// `Other.Final`) and `Chain` (to `Other.Hop`, itself a redirector)
pub fn content(client: &Client) {
    let v = version(client.variant);

    let mut other = PackageBuilder::new(v);
    let last = other
        .object("S1Game", "S1Thing", PackageIndex::NULL, "Final")
        .unwrap();
    let tags = vec![other.tag("Value", PropertyType::Int, PropertyValue::Int(7))];
    other.set_tags(last, tags).unwrap();
    other.redirector(PackageIndex::NULL, "Hop", last).unwrap();
    client.write("Other", &other);

    let mut content = PackageBuilder::new(v);
    let real = content
        .object("S1Game", "S1Thing", PackageIndex::NULL, "Real")
        .unwrap();
    let last = content.import_object("Other.Final", "S1Game", "S1Thing").unwrap();
    let hop = content
        .import_object("Other.Hop", "Core", "ObjectRedirector")
        .unwrap();
    let tags = vec![content.tag("Partner", PropertyType::Object, PropertyValue::Object(last))];
    content.set_tags(real, tags).unwrap();
    content.redirector(PackageIndex::NULL, "Old", real).unwrap();
    content.redirector(PackageIndex::NULL, "Far", last).unwrap();
    content.redirector(PackageIndex::NULL, "Chain", hop).unwrap();
    client.write("Content", &content);
}

/// Package `name` with one top-level `S1Thing` called `Thing`
pub fn thing_package(variant: Variant, name: &str, value: i32) -> Vec<u8> {
    let mut builder = PackageBuilder::new(version(variant)).folder(name);
    let thing = builder
        .object("S1Game", "S1Thing", PackageIndex::NULL, "Thing")
        .unwrap();
    let tags = vec![builder.tag("Value", PropertyType::Int, PropertyValue::Int(value))];
    builder.set_tags(thing, tags).unwrap();
    builder.build().unwrap()
}

/// Store `packages` back to back (with padding) in `storage` and return the
/// matching section
pub fn storage_file(client: &Client, storage: &str, packages: &[(&str, &str, Vec<u8>)]) -> CompositeSection {
    let mut blob = vec![0xEEu8; 37];
    let mut entries = Vec::new();
    for (object_path, composite_name, bytes) in packages {
        entries.push(CompositeEntry {
            filename: storage.to_string(),
            object_path: object_path.to_string(),
            composite_name: composite_name.to_string(),
            offset: blob.len() as u64,
            size: bytes.len() as u64,
        });
        blob.extend_from_slice(bytes);
        blob.extend_from_slice(&[0xEE; 13]);
    }
    std::fs::write(client.cooked().join(format!("{}.gpk", storage)), blob).unwrap();
    CompositeSection {
        filename: storage.to_string(),
        entries,
    }
}

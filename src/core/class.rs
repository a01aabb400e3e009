//! Class inheritance built from the bootstrap class packages
//!
//! Class exports (exports whose class index is null) declare their parent
//! through the export's super index. After every class package is open the
//! tree resolves each class's chain by following super names up to the root,
//! across package boundaries.

use crate::directory::PackageIndex;
use crate::error::{GpkError, Result};
use crate::package::Package;
use ahash::AHashMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub package: String,
    pub super_name: Option<String>,
    /// Root first, e.g. `Object.Actor.Light`
    pub chain: String,
}

impl ClassDescriptor {
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        self.chain.split('.')
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassTree {
    classes: AHashMap<String, ClassDescriptor>,
}

impl ClassTree {
    pub fn new() -> Self {
        ClassTree::default()
    }

    /// Build from a set of packages and resolve chains
    pub fn build<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Result<Self> {
        let mut tree = ClassTree::new();
        for package in packages {
            tree.add_package(package)?;
        }
        tree.resolve()?;
        Ok(tree)
    }

    /// Record every class export of `package`; returns how many were added
    ///
    /// A class declared twice keeps its first declaration.
    pub fn add_package(&mut self, package: &Package) -> Result<usize> {
        let names = package.names();
        let dir = package.directory();
        let mut added = 0;
        for (slot, export) in dir.exports().iter().enumerate() {
            if !export.class.is_null() {
                continue;
            }
            let index = PackageIndex::from_export(slot)?;
            let name = dir.object_name(index, &names)?;
            let super_name = if export.super_index.is_null() {
                None
            } else {
                Some(dir.object_name(export.super_index, &names)?)
            };
            let key = name.to_ascii_lowercase();
            if self.classes.contains_key(&key) {
                continue;
            }
            self.classes.insert(
                key,
                ClassDescriptor {
                    chain: name.clone(),
                    name,
                    package: package.name().to_string(),
                    super_name,
                },
            );
            added += 1;
        }
        Ok(added)
    }

    /// Compute every chain; a super cycle is corruption
    ///
    /// A super class that is not in the tree still appears as the root of
    /// the chain.
    pub fn resolve(&mut self) -> Result<()> {
        let mut chains = Vec::with_capacity(self.classes.len());
        for (key, class) in &self.classes {
            let mut parts = vec![class.name.clone()];
            let mut next = class.super_name.clone();
            while let Some(super_name) = next {
                if parts.len() > self.classes.len() + 1 {
                    return Err(GpkError::corrupt(
                        format!("class {}", class.name),
                        "cyclic superclass chain",
                    ));
                }
                match self.classes.get(&super_name.to_ascii_lowercase()) {
                    Some(parent) => {
                        parts.push(parent.name.clone());
                        next = parent.super_name.clone();
                    }
                    None => {
                        parts.push(super_name);
                        next = None;
                    }
                }
            }
            parts.reverse();
            chains.push((key.clone(), parts.join(".")));
        }
        for (key, chain) in chains {
            if let Some(class) = self.classes.get_mut(&key) {
                class.chain = chain;
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.get(&name.to_ascii_lowercase())
    }

    pub fn chain(&self, name: &str) -> Option<&str> {
        self.get(name).map(|c| c.chain.as_str())
    }

    /// Whether `class` is `ancestor` or derives from it
    pub fn is_a(&self, class: &str, ancestor: &str) -> bool {
        self.get(class)
            .map(|c| c.ancestors().any(|a| a.eq_ignore_ascii_case(ancestor)))
            .unwrap_or(false)
    }

    /// All classes sorted by chain
    pub fn classes(&self) -> Vec<&ClassDescriptor> {
        let mut out: Vec<_> = self.classes.values().collect();
        out.sort_by(|a, b| a.chain.cmp(&b.chain));
        out
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

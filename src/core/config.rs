//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a file only needs the
//! keys it changes.
//!
//! ```toml
//! root_path = "D:/TERA/Client/S1Game"
//! variant = "modern"
//! extra_class_packages = ["GFxUI"]
//! ```

use crate::error::{GpkError, Result};
use crate::package::LoadOptions;
use crate::version::FormatVersion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client build the content directory belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// 32-bit client, plain package files only
    Legacy,
    /// 64-bit client with composite bundles
    #[default]
    Modern,
}

impl Variant {
    pub fn format_version(self) -> FormatVersion {
        match self {
            Variant::Legacy => FormatVersion::Legacy,
            Variant::Modern => FormatVersion::Modern,
        }
    }

    /// Class packages that must load, in bootstrap order
    pub fn essential_class_packages(self) -> &'static [&'static str] {
        &["Core", "Engine", "GameFramework", "S1Game"]
    }

    /// Class packages loaded when present
    pub fn extra_class_packages(self) -> &'static [&'static str] {
        match self {
            Variant::Legacy => &["GFxUI", "IpDrv", "UnrealEd", "WinDrv"],
            Variant::Modern => &["GFxUI", "IpDrv", "OnlineSubsystemPC", "WinDrv"],
        }
    }

    /// Whether the mapper files are required at startup
    pub fn requires_mappers(self) -> bool {
        self == Variant::Modern
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Content root (the `S1Game` directory of a client)
    pub root_path: PathBuf,

    pub variant: Variant,

    /// Replaces the variant's essential class package list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_packages: Option<Vec<String>>,

    /// Replaces the variant's optional class package list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_class_packages: Option<Vec<String>>,

    /// Package directory below the root
    pub cooked_dir: String,

    pub composite_mapper: String,
    pub package_mapper: String,
    pub redirector_mapper: String,

    /// Load referenced objects after an object's own data
    pub load_dependencies: bool,

    /// Ceiling on struct/array nesting inside property streams
    pub max_property_depth: usize,

    /// Items between cancellation checks in batch operations
    pub cancel_poll_interval: usize,

    /// Released packages kept open for reuse
    pub released_cache_capacity: usize,

    pub dump_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            root_path: PathBuf::from("."),
            variant: Variant::default(),
            class_packages: None,
            extra_class_packages: None,
            cooked_dir: "CookedPC".to_string(),
            composite_mapper: "CompositePackageMapper.dat".to_string(),
            package_mapper: "PkgMapper.dat".to_string(),
            redirector_mapper: "ObjectRedirectorMapper.dat".to_string(),
            load_dependencies: true,
            max_property_depth: 64,
            cancel_poll_interval: 32,
            released_cache_capacity: 16,
            dump_workers: 4,
        }
    }
}

impl EngineConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root_path: root_path.into(),
            ..EngineConfig::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        EngineConfig::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GpkError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_property_depth == 0 {
            return Err(GpkError::Config("max_property_depth must be at least 1".into()));
        }
        if self.cancel_poll_interval == 0 {
            return Err(GpkError::Config("cancel_poll_interval must be at least 1".into()));
        }
        if self.dump_workers == 0 {
            return Err(GpkError::Config("dump_workers must be at least 1".into()));
        }
        if self.released_cache_capacity == 0 {
            return Err(GpkError::Config("released_cache_capacity must be at least 1".into()));
        }
        if let Some(packages) = &self.class_packages {
            if packages.is_empty() {
                return Err(GpkError::Config("class_packages must not be empty".into()));
            }
        }
        for (key, file) in [
            ("composite_mapper", &self.composite_mapper),
            ("package_mapper", &self.package_mapper),
            ("redirector_mapper", &self.redirector_mapper),
        ] {
            if file.is_empty() {
                return Err(GpkError::Config(format!("{} must name a file", key)));
            }
        }
        Ok(())
    }

    pub fn cooked_path(&self) -> PathBuf {
        self.root_path.join(&self.cooked_dir)
    }

    pub fn essential_class_packages(&self) -> Vec<String> {
        match &self.class_packages {
            Some(list) => list.clone(),
            None => to_owned(self.variant.essential_class_packages()),
        }
    }

    pub fn extra_class_packages(&self) -> Vec<String> {
        match &self.extra_class_packages {
            Some(list) => list.clone(),
            None => to_owned(self.variant.extra_class_packages()),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            max_property_depth: self.max_property_depth,
            load_dependencies: self.load_dependencies,
        }
    }
}

fn to_owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cooked_path(), PathBuf::from("./CookedPC"));
        assert_eq!(config.essential_class_packages()[0], "Core");
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            root_path = "/games/tera"
            variant = "legacy"
            extra_class_packages = []
            max_property_depth = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.variant, Variant::Legacy);
        assert!(config.extra_class_packages().is_empty());
        assert_eq!(config.load_options().max_property_depth, 16);
        assert!(!config.variant.requires_mappers());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("dump_workers = 0"),
            Err(GpkError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("variant = \"ps4\""),
            Err(GpkError::Toml(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EngineConfig::new("/tmp/root");
        config.class_packages = Some(vec!["Core".into()]);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}

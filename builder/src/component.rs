// Licensed under the Apache-2.0 license

//! Binds the declared image components to their backing files and partitions.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::{ComponentConfig, ImageConfig};
use crate::error::{ImageError, Result};
use crate::partition::{PartitionRange, PartitionTable};

/// Returns the first existing `dir/name`, then `name` itself.
pub fn resolve_file(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    search_dirs
        .iter()
        .map(|dir| dir.join(name))
        .chain(std::iter::once(PathBuf::from(name)))
        .find(|path| path.is_file())
}

/// Ordered list of directories searched for input files.
#[derive(Debug, Clone, Default)]
pub struct FileResolver {
    search_dirs: Vec<PathBuf>,
}

impl FileResolver {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut search_dirs: Vec<PathBuf> = Vec::new();
        for dir in dirs.into_iter().map(Into::into) {
            if !search_dirs.contains(&dir) {
                search_dirs.push(dir);
            }
        }
        Self { search_dirs }
    }

    /// Key material first, then data.
    pub fn with_key_dir(keydir: &Path, datadir: &Path) -> Self {
        Self::new([keydir, datadir])
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        resolve_file(name, &self.search_dirs)
    }

    pub fn require(&self, name: &str) -> Result<PathBuf> {
        self.resolve(name)
            .ok_or_else(|| ImageError::MissingFile(name.to_string()))
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.require(name)?;
        std::fs::read(&path).map_err(ImageError::file(path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Updater,
    Target,
    Extension,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Updater => "updater",
            Section::Target => "target",
            Section::Extension => "extension",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    pub section: Section,
    pub name: String,
    pub config: ComponentConfig,
    /// `None` when an optional file is absent.
    pub path: Option<PathBuf>,
    pub file_size: u64,
    /// Range of the first listed partition, if any.
    pub partition: Option<PartitionRange>,
    /// Offset inside the container, assigned when the meta area is written.
    pub file_offset: u64,
}

impl Component {
    /// Name stored in the meta record, e.g. "image.target.spl".
    pub fn meta_name(&self) -> String {
        format!("image.{}.{}", self.section, self.name)
    }

    pub fn is_present(&self) -> bool {
        self.file_size > 0
    }
}

/// Resolves every component of the updater, target and extension sections.
///
/// Extension components are left out of signed images.
pub fn resolve_components(
    cfg: &ImageConfig,
    table: &PartitionTable,
    files: &FileResolver,
    sign: bool,
) -> Result<Vec<Component>> {
    let mut sections = vec![
        (Section::Updater, &cfg.image.updater),
        (Section::Target, &cfg.image.target),
    ];
    if !sign {
        sections.push((Section::Extension, &cfg.image.extension));
    }

    let mut components = Vec::new();
    for (section, entries) in sections {
        for (name, config) in entries {
            components.push(resolve_component(section, name, config, table, files)?);
        }
    }
    Ok(components)
}

fn resolve_component(
    section: Section,
    name: &str,
    config: &ComponentConfig,
    table: &PartitionTable,
    files: &FileResolver,
) -> Result<Component> {
    let path = files.resolve(&config.file);
    let file_size = match &path {
        Some(path) => std::fs::metadata(path)
            .map_err(ImageError::file(path))?
            .len(),
        None if config.is_required() => {
            return Err(ImageError::MissingFile(config.file.clone()));
        }
        None => {
            warn!("{} is not found, skipped optional component {}", config.file, name);
            0
        }
    };

    let mut partition = None;
    if let Some(parts) = &config.part {
        for (i, reference) in parts.items().into_iter().enumerate() {
            let range = table.lookup(reference)?;
            if i == 0 {
                partition = Some(range);
            }
        }
    }

    debug!(
        "Component image.{}.{}: {} ({} bytes)",
        section, name, config.file, file_size
    );
    Ok(Component {
        section,
        name: name.to_string(),
        config: config.clone(),
        path,
        file_size,
        partition,
        file_offset: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::partition::resolve_partitions;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"{
        "spi-nor": {
            "size": "16m",
            "partitions": {
                "spl":    { "size": "256k" },
                "kernel": { "size": "4m" },
                "rootfs": { "size": "-" },
            },
        },
        "image": {
            "info": {
                "platform": "d211", "product": "nor", "version": "1.0",
                "media": { "type": "spi-nor", "device_id": 0 },
            },
            "updater": {
                "spl": { "file": "u-boot-spl.aic", "attr": ["block", "required"] },
            },
            "target": {
                "spl":    { "file": "u-boot-spl.aic", "attr": ["block", "required"], "part": ["spl"] },
                "kernel": { "file": "kernel.itb", "attr": ["block", "optional"], "part": "kernel;rootfs" },
            },
            "extension": {
                "tools": { "file": "tools.tar", "attr": "optional" },
            },
        },
    }"#;

    fn setup() -> (TempDir, ImageConfig, PartitionTable) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("u-boot-spl.aic"), vec![0x5A; 3000]).unwrap();
        let cfg = parse_config(CONFIG).unwrap();
        let table = resolve_partitions(&cfg).unwrap();
        (dir, cfg, table)
    }

    #[test]
    fn test_resolve_file_search_order() {
        let keydir = TempDir::new().unwrap();
        let datadir = TempDir::new().unwrap();
        fs::write(keydir.path().join("key.bin"), b"key").unwrap();
        fs::write(datadir.path().join("key.bin"), b"data").unwrap();
        fs::write(datadir.path().join("only-data.bin"), b"data").unwrap();

        let files = FileResolver::with_key_dir(keydir.path(), datadir.path());
        assert_eq!(files.resolve("key.bin").unwrap(), keydir.path().join("key.bin"));
        assert_eq!(
            files.resolve("only-data.bin").unwrap(),
            datadir.path().join("only-data.bin")
        );
        assert!(files.resolve("nothing.bin").is_none());
        assert!(matches!(
            files.require("nothing.bin"),
            Err(ImageError::MissingFile(name)) if name == "nothing.bin"
        ));
        assert_eq!(files.read("key.bin").unwrap(), b"key");
    }

    #[test]
    fn test_optional_component_resolves_to_zero() {
        let (dir, cfg, table) = setup();
        let files = FileResolver::new([dir.path()]);
        let components = resolve_components(&cfg, &table, &files, false).unwrap();
        assert_eq!(components.len(), 4);

        let kernel = components.iter().find(|c| c.name == "kernel").unwrap();
        assert_eq!(kernel.file_size, 0);
        assert!(kernel.path.is_none());
        assert!(!kernel.is_present());
        assert_eq!(kernel.partition, Some(table.lookup("kernel").unwrap()));

        let spl = &components[1];
        assert_eq!(spl.meta_name(), "image.target.spl");
        assert_eq!(spl.file_size, 3000);
    }

    #[test]
    fn test_required_component_missing() {
        let (dir, cfg, table) = setup();
        fs::remove_file(dir.path().join("u-boot-spl.aic")).unwrap();
        let files = FileResolver::new([dir.path()]);
        let err = resolve_components(&cfg, &table, &files, false).unwrap_err();
        assert!(matches!(err, ImageError::MissingFile(name) if name == "u-boot-spl.aic"));
    }

    #[test]
    fn test_signed_build_skips_extension() {
        let (dir, cfg, table) = setup();
        let files = FileResolver::new([dir.path()]);
        let components = resolve_components(&cfg, &table, &files, true).unwrap();
        assert!(components.iter().all(|c| c.section != Section::Extension));
    }

    #[test]
    fn test_unknown_partition_reference() {
        let (dir, mut cfg, table) = setup();
        cfg.image.target["kernel"].part =
            Some(crate::config::OneOrMany::One("boot".to_string()));
        let files = FileResolver::new([dir.path()]);
        let err = resolve_components(&cfg, &table, &files, false).unwrap_err();
        assert!(matches!(err, ImageError::Config(_)), "{}", err);
    }
}

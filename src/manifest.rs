//! Component manifests and the store that locates them.
//!
//! A component directory holds `artifacts/component.toml` describing
//! the component, next to its compiled objects. Manifests are loaded
//! lazily while the graph loader walks the dependency closure; the
//! [`ManifestStore`] trait keeps resolution testable without disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::descriptor::Mode;
use crate::term::Term;

/// Relative path of the manifest inside a component directory.
pub const MANIFEST_FILE: &str = "artifacts/component.toml";

/// One resolved component. Exactly one entry per symbolic name in the
/// resolved map; `mode` is filled in by graph resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentManifest {
    pub name: String,
    pub version: String,
    /// Component directory holding `artifacts/`, `priv/`, `include/`.
    pub dir: PathBuf,
    /// Resolved lifecycle mode.
    pub mode: Mode,
    /// Declared dependencies, in declaration order.
    pub requires: Vec<String>,
    /// Subset of `requires` the component can start without.
    pub optional: Vec<String>,
    /// Sub-components started as part of this component.
    pub included: Vec<String>,
    /// Configuration keys captured at compile time.
    pub env_keys: Vec<String>,
    /// Found under the platform root rather than the build output.
    pub platform_provided: bool,
}

impl ComponentManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>, dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dir,
            mode: Mode::None,
            requires: Vec::new(),
            optional: Vec::new(),
            included: Vec::new(),
            env_keys: Vec::new(),
            platform_provided: false,
        }
    }

    /// Directory holding the compiled objects and the manifest itself.
    pub fn artifact_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    /// `<name>-<version>`, the directory name under the bundle's `lib/`.
    pub fn target_dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    component: ComponentToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComponentToml {
    name: String,
    version: String,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
    #[serde(default)]
    included: Vec<String>,
    #[serde(default)]
    env_keys: Vec<String>,
}

/// Load and validate the manifest stored in `dir`.
pub fn load_component_manifest(dir: &Path, platform_provided: bool) -> Result<ComponentManifest> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading component manifest '{}'", manifest_path.display()))?;
    let parsed: ManifestToml = toml::from_str(&raw)
        .with_context(|| format!("parsing component manifest '{}'", manifest_path.display()))?;
    let component = parsed.component;

    if !Term::is_valid_symbol(&component.name) {
        bail!(
            "invalid component name '{}' in '{}': expected lowercase start, alphanumeric plus underscore",
            component.name,
            manifest_path.display()
        );
    }
    if component.version.trim().is_empty() {
        bail!(
            "component '{}' in '{}' has an empty version",
            component.name,
            manifest_path.display()
        );
    }
    for optional in &component.optional {
        if !component.requires.contains(optional) {
            bail!(
                "component '{}' in '{}' marks '{}' optional without declaring it required",
                component.name,
                manifest_path.display(),
                optional
            );
        }
    }

    Ok(ComponentManifest {
        name: component.name,
        version: component.version,
        dir: dir.to_path_buf(),
        mode: Mode::None,
        requires: component.requires,
        optional: component.optional,
        included: component.included,
        env_keys: component.env_keys,
        platform_provided,
    })
}

/// Normalize manifest text through the canonical formatter. Content is
/// preserved; representation is not.
pub fn canonical_manifest_text(raw: &str) -> Result<String> {
    let value: toml::Value = toml::from_str(raw).context("parsing manifest for re-serialization")?;
    toml::to_string_pretty(&value).context("re-serializing manifest")
}

/// Where resolution finds manifests. The disk store searches the
/// platform root first, then the local build output; tests use
/// [`MemoryManifestStore`].
pub trait ManifestStore {
    /// Locate and load the manifest for `name`, or `None` when no
    /// component directory can be found.
    fn load(&self, name: &str) -> Result<Option<ComponentManifest>>;
}

/// Disk-backed manifest store.
#[derive(Debug, Clone)]
pub struct DiskManifestStore {
    /// External platform installation; its `lib/` is searched first.
    pub platform_root: Option<PathBuf>,
    /// Local build output root, searched second.
    pub build_root: PathBuf,
}

impl DiskManifestStore {
    pub fn new(platform_root: Option<PathBuf>, build_root: PathBuf) -> Self {
        Self {
            platform_root,
            build_root,
        }
    }

    /// Find the component directory for `name` under `root`: either
    /// `<root>/<name>` or `<root>/<name>-<version>`, whichever carries
    /// a manifest. With several versioned directories the greatest
    /// name wins.
    fn find_component_dir(root: &Path, name: &str) -> Result<Option<PathBuf>> {
        if !root.is_dir() {
            return Ok(None);
        }
        let prefix = format!("{name}-");
        let mut best: Option<PathBuf> = None;
        for entry in fs::read_dir(root)
            .with_context(|| format!("listing component root '{}'", root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name();
            let dir_name = dir_name.to_string_lossy();
            if dir_name != name && !dir_name.starts_with(&prefix) {
                continue;
            }
            if !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let replace = match &best {
                Some(current) => current.file_name() < path.file_name(),
                None => true,
            };
            if replace {
                best = Some(path);
            }
        }
        Ok(best)
    }
}

impl ManifestStore for DiskManifestStore {
    fn load(&self, name: &str) -> Result<Option<ComponentManifest>> {
        if let Some(platform_root) = &self.platform_root {
            if let Some(dir) = Self::find_component_dir(&platform_root.join("lib"), name)? {
                let manifest = load_component_manifest(&dir, true)?;
                if manifest.name != name {
                    bail!(
                        "component directory '{}' declares name '{}', expected '{}'",
                        dir.display(),
                        manifest.name,
                        name
                    );
                }
                return Ok(Some(manifest));
            }
        }
        if let Some(dir) = Self::find_component_dir(&self.build_root, name)? {
            let manifest = load_component_manifest(&dir, false)?;
            if manifest.name != name {
                bail!(
                    "component directory '{}' declares name '{}', expected '{}'",
                    dir.display(),
                    manifest.name,
                    name
                );
            }
            return Ok(Some(manifest));
        }
        Ok(None)
    }
}

/// In-memory store for tests and programmatic assembly.
#[derive(Debug, Clone, Default)]
pub struct MemoryManifestStore {
    manifests: BTreeMap<String, ComponentManifest>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manifest: ComponentManifest) {
        self.manifests.insert(manifest.name.clone(), manifest);
    }
}

impl ManifestStore for MemoryManifestStore {
    fn load(&self, name: &str) -> Result<Option<ComponentManifest>> {
        Ok(self.manifests.get(name).cloned())
    }
}

//! Project configuration: `release.toml` to a release descriptor.
//!
//! Raw TOML structs stay private and strict (`deny_unknown_fields`);
//! conversion into domain types validates everything the descriptor
//! itself cannot know about (modes, step names, provider init terms,
//! path resolution relative to the project file).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::{read_runtime_config, RuntimeConfig};
use crate::descriptor::{Mode, ProviderSpec, ReleaseDescriptor, ReleaseOptions, StripOption};
use crate::manifest::DiskManifestStore;
use crate::pipeline::{AssembleEnv, Stage, Step};
use crate::term::{self, Term};

/// Everything the pipeline needs, loaded from one project file.
#[derive(Debug)]
pub struct LoadedProject {
    pub descriptor: ReleaseDescriptor,
    pub env: AssembleEnv,
    pub store: DiskManifestStore,
    pub static_config: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectToml {
    release: ReleaseToml,
    paths: PathsToml,
    options: Option<OptionsToml>,
    #[serde(default)]
    providers: Vec<ProviderToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseToml {
    name: String,
    version: String,
    #[serde(default)]
    overlays: Vec<String>,
    steps: Option<Vec<String>>,
    #[serde(default)]
    components: Vec<RootToml>,
    #[serde(default)]
    overrides: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootToml {
    name: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    build_root: String,
    bundle_root: String,
    platform_root: Option<String>,
    platform_version: Option<String>,
    static_config: Option<String>,
    overlay_root: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StripToml {
    Flag(bool),
    Keep(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsToml {
    strip: Option<StripToml>,
    compress_artifacts: Option<bool>,
    reboot_after_config: Option<bool>,
    start_distribution_during_config: Option<bool>,
    validate_compile_env: Option<bool>,
    prune_runtime_config: Option<bool>,
    skip_mode_checks_for: Option<Vec<String>>,
    include_platform_runtime: Option<bool>,
    #[serde(default)]
    extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderToml {
    name: String,
    init: Option<String>,
}

/// Load and validate a project file.
pub fn load_project(path: &Path) -> Result<LoadedProject> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading project configuration '{}'", path.display()))?;
    let parsed: ProjectToml = toml::from_str(&raw)
        .with_context(|| format!("parsing project configuration '{}'", path.display()))?;
    let project_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let steps = parse_steps(parsed.release.steps.as_deref(), path)?;
    let bundle_root = resolve_path(&project_dir, &parsed.paths.bundle_root);
    let mut descriptor = ReleaseDescriptor::new(
        parsed.release.name,
        parsed.release.version,
        bundle_root,
        steps,
    )
    .with_context(|| format!("invalid project configuration '{}'", path.display()))?;

    for root in parsed.release.components {
        let mode = parse_mode(root.mode.as_deref().unwrap_or("permanent"), &root.name, path)?;
        descriptor.root_requirements.push((root.name, mode));
    }
    for (name, mode) in parsed.release.overrides {
        let mode = parse_mode(&mode, &name, path)?;
        descriptor.mode_overrides.insert(name, mode);
    }

    descriptor.options = parse_options(parsed.options);
    descriptor.overlays = parsed
        .release
        .overlays
        .into_iter()
        .map(PathBuf::from)
        .collect();

    for provider in parsed.providers {
        let init = match provider.init.as_deref() {
            Some(text) => term::parse(text).map_err(|err| {
                anyhow::anyhow!(
                    "invalid init term for provider '{}' in '{}': {err}",
                    provider.name,
                    path.display()
                )
            })?,
            None => Term::List(Vec::new()),
        };
        descriptor.config_providers.push(ProviderSpec {
            name: provider.name,
            init,
        });
    }

    let platform_root = parsed
        .paths
        .platform_root
        .as_deref()
        .map(|p| resolve_path(&project_dir, p));
    let store = DiskManifestStore::new(
        platform_root.clone(),
        resolve_path(&project_dir, &parsed.paths.build_root),
    );
    let env = AssembleEnv {
        platform_root,
        platform_version: parsed
            .paths
            .platform_version
            .unwrap_or_else(|| "unbundled".to_string()),
        extra_search_paths: Vec::new(),
        overlay_root: parsed
            .paths
            .overlay_root
            .as_deref()
            .map(|p| resolve_path(&project_dir, p))
            .unwrap_or(project_dir),
    };

    let static_config = match parsed.paths.static_config.as_deref() {
        Some(config_path) => read_runtime_config(&resolve_path(&env.overlay_root, config_path))
            .with_context(|| format!("loading static configuration for '{}'", path.display()))?,
        None => RuntimeConfig::default(),
    };

    Ok(LoadedProject {
        descriptor,
        env,
        store,
        static_config,
    })
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

fn parse_mode(raw: &str, component: &str, config_path: &Path) -> Result<Mode> {
    raw.parse().map_err(|_| {
        anyhow::anyhow!(
            "invalid project configuration '{}': unrecognized mode '{}' for component '{}'",
            config_path.display(),
            raw,
            component
        )
    })
}

fn parse_steps(raw: Option<&[String]>, config_path: &Path) -> Result<Vec<Step>> {
    let Some(raw) = raw else {
        return Ok(vec![Step::Named(Stage::Assemble)]);
    };
    let mut steps = Vec::with_capacity(raw.len());
    for name in raw {
        let step = match name.trim().to_ascii_lowercase().as_str() {
            "assemble" => Step::Named(Stage::Assemble),
            "tar" => Step::Named(Stage::Tar),
            other => bail!(
                "invalid project configuration '{}': unsupported step '{}' (expected 'assemble' or 'tar')",
                config_path.display(),
                other
            ),
        };
        steps.push(step);
    }
    Ok(steps)
}

fn parse_options(raw: Option<OptionsToml>) -> ReleaseOptions {
    let mut options = ReleaseOptions::default();
    let Some(raw) = raw else {
        return options;
    };
    if let Some(strip) = raw.strip {
        options.strip = match strip {
            StripToml::Flag(false) => StripOption::Disabled,
            StripToml::Flag(true) => StripOption::Enabled { keep: Vec::new() },
            StripToml::Keep(keep) => StripOption::Enabled { keep },
        };
    }
    if let Some(value) = raw.compress_artifacts {
        options.compress_artifacts = value;
    }
    if let Some(value) = raw.reboot_after_config {
        options.reboot_after_config = value;
    }
    if let Some(value) = raw.start_distribution_during_config {
        options.start_distribution_during_config = value;
    }
    if let Some(value) = raw.validate_compile_env {
        options.validate_compile_env = value;
    }
    if let Some(value) = raw.prune_runtime_config {
        options.prune_runtime_config = value;
    }
    if let Some(value) = raw.skip_mode_checks_for {
        options.skip_mode_checks_for = value;
    }
    if let Some(value) = raw.include_platform_runtime {
        options.include_platform_runtime = value;
    }
    options.extra = raw.extra;
    options
}

//! The assembly pipeline: an ordered list of steps folding a release
//! descriptor from project configuration to a populated bundle.
//!
//! Named stages cover the common path (`Assemble`, then optionally
//! `Tar`); custom steps are plain functions from descriptor to
//! descriptor. The step list is validated once at descriptor
//! construction. `run` aborts on the first error; the assemble
//! sub-operations are public so a caller can run them independently
//! and continue past a failed independent sub-step.

use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::boot::{self, BootScriptResult, InstructionCompiler};
use crate::config::{self, RuntimeConfig, RUNTIME_CONFIG_FILE};
use crate::descriptor::{DescriptorError, ReleaseDescriptor};
use crate::graph;
use crate::manifest::ManifestStore;
use crate::package;

/// Named pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Resolve, write boot scripts and configuration, package
    /// artifacts.
    Assemble,
    /// Archive the assembled bundle as `<name>-<version>.tar.zst`.
    Tar,
}

/// A custom pipeline step.
pub type CustomStepFn = fn(ReleaseDescriptor) -> Result<ReleaseDescriptor>;

/// One pipeline step: a named stage or a custom function.
#[derive(Debug, Clone)]
pub enum Step {
    Named(Stage),
    Custom(CustomStepFn),
}

/// Validate a step list: exactly one `Assemble`, at most one `Tar`,
/// and `Tar` never before `Assemble`.
pub fn validate_steps(steps: &[Step]) -> Result<(), DescriptorError> {
    let mut assemble_at: Option<usize> = None;
    let mut tar_at: Option<usize> = None;
    for (at, step) in steps.iter().enumerate() {
        if let Step::Named(stage) = step {
            match stage {
                Stage::Assemble => {
                    if assemble_at.is_some() {
                        return Err(DescriptorError::DuplicateAssemble);
                    }
                    assemble_at = Some(at);
                }
                Stage::Tar => {
                    if tar_at.is_some() {
                        return Err(DescriptorError::DuplicateTar);
                    }
                    tar_at = Some(at);
                }
            }
        }
    }
    let Some(assemble_at) = assemble_at else {
        return Err(DescriptorError::MissingAssemble);
    };
    if let Some(tar_at) = tar_at {
        if tar_at < assemble_at {
            return Err(DescriptorError::TarBeforeAssemble);
        }
    }
    Ok(())
}

/// Ambient host settings, passed explicitly instead of read from the
/// process environment.
#[derive(Debug, Clone)]
pub struct AssembleEnv {
    /// External platform installation, when one is available.
    pub platform_root: Option<PathBuf>,
    /// Version of the platform runtime recorded in boot sequences.
    pub platform_version: String,
    /// Extra search paths a parent coordination layer injects ahead
    /// of the bundled ones.
    pub extra_search_paths: Vec<String>,
    /// Directory overlay paths are relative to.
    pub overlay_root: PathBuf,
}

impl Default for AssembleEnv {
    fn default() -> Self {
        Self {
            platform_root: None,
            platform_version: "unbundled".to_string(),
            extra_search_paths: Vec::new(),
            overlay_root: PathBuf::from("."),
        }
    }
}

/// Drives the pipeline. Holds the collaborators every step may need:
/// the manifest store, the instruction compiler, the ambient host
/// settings and the static runtime configuration.
pub struct Runner<'a> {
    pub store: &'a dyn ManifestStore,
    pub compiler: &'a dyn InstructionCompiler,
    pub env: AssembleEnv,
    pub static_config: RuntimeConfig,
}

impl Runner<'_> {
    /// Fold the descriptor through its step list.
    pub fn run(&self, descriptor: ReleaseDescriptor) -> Result<ReleaseDescriptor> {
        validate_steps(&descriptor.steps)?;
        let steps = descriptor.steps.clone();
        let mut descriptor = descriptor;
        for step in &steps {
            descriptor = match step {
                Step::Named(Stage::Assemble) => self.assemble(descriptor)?,
                Step::Named(Stage::Tar) => {
                    tar_bundle(&descriptor)?;
                    descriptor
                }
                Step::Custom(custom) => custom(descriptor)?,
            };
        }
        Ok(descriptor)
    }

    /// The assemble stage: resolve the component graph, build and
    /// write the boot sequences, merge and write the runtime
    /// configuration, copy overlays, and package every component.
    pub fn assemble(&self, mut descriptor: ReleaseDescriptor) -> Result<ReleaseDescriptor> {
        let roots = descriptor.effective_roots();
        descriptor.components = graph::resolve(&roots, &descriptor.mode_overrides, self.store)?;
        descriptor.boot_sequences = boot::build_sequences(&roots, &descriptor.components);

        fs::create_dir_all(&descriptor.version_path).with_context(|| {
            format!(
                "creating release version directory '{}'",
                descriptor.version_path.display()
            )
        })?;

        self.build_boot_scripts(&descriptor)?;

        let provider_config_path = format!("releases/{}/provider.toml", descriptor.version);
        let (runtime_config, reboot) = config::build_runtime_config(
            &descriptor,
            self.static_config.clone(),
            &provider_config_path,
        )?;
        config::write_runtime_config(
            &runtime_config,
            &descriptor.version_path.join(RUNTIME_CONFIG_FILE),
            reboot,
        )?;

        package::copy_overlays(&descriptor, &self.env.overlay_root)?;
        package::package_components(&descriptor)?;
        if descriptor.options.include_platform_runtime {
            if let Some(platform_root) = &self.env.platform_root {
                package::copy_platform_runtime(
                    &descriptor,
                    platform_root,
                    &self.env.platform_version,
                )?;
            }
        }
        Ok(descriptor)
    }

    /// Build every boot sequence, aggregating per-sequence failures
    /// into one error.
    pub fn build_boot_scripts(&self, descriptor: &ReleaseDescriptor) -> Result<()> {
        let mut failures = Vec::new();
        for (name, entries) in &descriptor.boot_sequences {
            let result = boot::build_boot_script(
                descriptor,
                name,
                entries,
                self.compiler,
                &self.env.platform_version,
                &self.env.extra_search_paths,
            );
            if let BootScriptResult::Failed { message } = result {
                failures.push(message);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{}", failures.join("\n"))
        }
    }
}

/// Archive the bundle deterministically: entries sorted by relative
/// path, zeroed mtime/uid/gid, zstd-compressed.
pub fn tar_bundle(descriptor: &ReleaseDescriptor) -> Result<PathBuf> {
    let out_path = descriptor.root.join(format!(
        "{}-{}.tar.zst",
        descriptor.name, descriptor.version
    ));
    let out = File::create(&out_path)
        .with_context(|| format!("creating bundle archive '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = tar::Builder::new(encoder);

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(&descriptor.root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path == descriptor.root || path == out_path {
            continue;
        }
        entries.push(path.to_path_buf());
    }
    entries.sort_by(|a, b| {
        let rel_a = a.strip_prefix(&descriptor.root).unwrap_or(a).to_string_lossy();
        let rel_b = b.strip_prefix(&descriptor.root).unwrap_or(b).to_string_lossy();
        rel_a.cmp(&rel_b)
    });

    for path in entries {
        let rel = path
            .strip_prefix(&descriptor.root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = fs::symlink_metadata(&path)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(metadata.permissions().mode());
        }

        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(target.to_string_lossy().as_ref())?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if metadata.is_file() {
            let mut file = File::open(&path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut file)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing bundle archive")?;
    encoder.finish()?;
    Ok(out_path)
}

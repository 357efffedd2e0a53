//! Boot order construction, validation, and instruction compilation.
//!
//! The resolved component map plus an explicit ordering become one or
//! more boot sequences; each sequence is validated, compiled into a
//! low-level instruction list via an [`InstructionCompiler`], rewritten
//! for configuration-provider injection and extra search paths, and
//! written next to its declarative description in the version path.

pub mod instructions;
pub mod validate;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::descriptor::{BootEntry, Mode, ReleaseDescriptor, FOUNDATION_COMPONENTS};
use crate::manifest::ComponentManifest;
use crate::term::{self, Term};

pub use instructions::{
    instructions_from_term, instructions_to_term, prepend_search_paths, splice_provider_apply,
    DefaultCompiler, Instruction, InstructionCompiler, PROVIDER_APPLY_TARGET, RELEASE_LIB_MARKER,
};
pub use validate::validate_boot_order;

/// Name of the full boot sequence.
pub const START_SEQUENCE: &str = "start";

/// Name of the clean boot sequence.
pub const CLEAN_SEQUENCE: &str = "start_clean";

/// Per-sequence validation and construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("boot sequence names unknown component '{0}'")]
    UnknownComponent(String),
    #[error("unrecognized lifecycle mode '{mode}' for component '{component}'")]
    UnrecognizedMode { component: String, mode: String },
    #[error("component '{component}' requires '{dependency}', which is missing from the boot sequence")]
    DanglingDependency {
        component: String,
        dependency: String,
    },
    #[error("component '{component}' ({component_mode}) requires '{dependency}', which is only '{dependency_mode}' and will not be started")]
    UnsafeModeCombination {
        component: String,
        component_mode: Mode,
        dependency: String,
        dependency_mode: Mode,
    },
}

/// Build the two boot sequences from the resolved map.
///
/// `start` lists the root requirements first, in the order they were
/// requested, followed by every transitively pulled component sorted
/// by name. `start_clean` downgrades every mode to `load`, keeping
/// `none` unchanged and the foundation components `permanent`.
pub fn build_sequences(
    roots: &[(String, Mode)],
    resolved: &BTreeMap<String, ComponentManifest>,
) -> BTreeMap<String, Vec<BootEntry>> {
    let mut full: Vec<BootEntry> = Vec::with_capacity(resolved.len());
    for (name, _) in roots {
        if full.iter().any(|entry| &entry.component == name) {
            continue;
        }
        if let Some(manifest) = resolved.get(name) {
            full.push(BootEntry::new(name.clone(), manifest.mode));
        }
    }
    for (name, manifest) in resolved {
        if !full.iter().any(|entry| &entry.component == name) {
            full.push(BootEntry::new(name.clone(), manifest.mode));
        }
    }

    let clean = full
        .iter()
        .map(|entry| BootEntry::new(entry.component.clone(), clean_mode(entry)))
        .collect();

    BTreeMap::from([
        (START_SEQUENCE.to_string(), full),
        (CLEAN_SEQUENCE.to_string(), clean),
    ])
}

fn clean_mode(entry: &BootEntry) -> Mode {
    if FOUNDATION_COMPONENTS.contains(&entry.component.as_str()) {
        Mode::Permanent
    } else if entry.mode == Mode::None {
        Mode::None
    } else {
        Mode::Load
    }
}

/// Encode the declarative sequence description: bundle name, version,
/// platform-runtime version, then one record per sequenced component.
pub fn sequence_to_term(
    descriptor: &ReleaseDescriptor,
    platform_version: &str,
    entries: &[BootEntry],
) -> Result<Term> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let manifest = descriptor
            .components
            .get(&entry.component)
            .ok_or_else(|| BootError::UnknownComponent(entry.component.clone()))?;
        let mut fields = vec![
            Term::sym(entry.component.clone()),
            Term::text(manifest.version.clone()),
            Term::sym(entry.mode.to_string()),
        ];
        if !manifest.included.is_empty() {
            fields.push(Term::List(
                manifest
                    .included
                    .iter()
                    .map(|name| Term::sym(name.clone()))
                    .collect(),
            ));
        }
        records.push(Term::Tuple(fields));
    }
    Ok(Term::Tuple(vec![
        Term::sym("release"),
        Term::Tuple(vec![
            Term::text(descriptor.name.clone()),
            Term::text(descriptor.version.clone()),
        ]),
        Term::text(platform_version.to_string()),
        Term::List(records),
    ]))
}

/// Outcome of building one boot script. Construction never raises
/// directly so callers can aggregate failures across sequences.
#[derive(Debug, Clone, PartialEq)]
pub enum BootScriptResult {
    Written { path: PathBuf },
    Failed { message: String },
}

/// Validate, compile, rewrite, and write one boot sequence.
///
/// Writes `<name>.seq` (declarative description) and `<name>.boot`
/// (compiled instruction list) into the descriptor's version path.
pub fn build_boot_script(
    descriptor: &ReleaseDescriptor,
    sequence_name: &str,
    entries: &[BootEntry],
    compiler: &dyn InstructionCompiler,
    platform_version: &str,
    extra_search_paths: &[String],
) -> BootScriptResult {
    match build_boot_script_inner(
        descriptor,
        sequence_name,
        entries,
        compiler,
        platform_version,
        extra_search_paths,
    ) {
        Ok(path) => BootScriptResult::Written { path },
        Err(err) => BootScriptResult::Failed {
            message: format!("boot sequence '{sequence_name}': {err:#}"),
        },
    }
}

fn build_boot_script_inner(
    descriptor: &ReleaseDescriptor,
    sequence_name: &str,
    entries: &[BootEntry],
    compiler: &dyn InstructionCompiler,
    platform_version: &str,
    extra_search_paths: &[String],
) -> Result<PathBuf> {
    validate_boot_order(
        &descriptor.components,
        entries,
        &descriptor.options.skip_mode_checks_for,
    )?;

    let mut compiled = compiler.compile(descriptor, entries)?;
    if !descriptor.config_providers.is_empty() {
        let config_path = format!(
            "releases/{}/{}",
            descriptor.version,
            crate::config::RUNTIME_CONFIG_FILE
        );
        compiled = splice_provider_apply(compiled, &config_path)?;
    }
    let compiled = prepend_search_paths(compiled, extra_search_paths);

    fs::create_dir_all(&descriptor.version_path).with_context(|| {
        format!(
            "creating release version directory '{}'",
            descriptor.version_path.display()
        )
    })?;

    let sequence_term = sequence_to_term(descriptor, platform_version, entries)?;
    let sequence_path = descriptor.version_path.join(format!("{sequence_name}.seq"));
    fs::write(&sequence_path, format!("{sequence_term}\n"))
        .with_context(|| format!("writing boot sequence '{}'", sequence_path.display()))?;

    let boot_text = format!("{}\n", instructions_to_term(&compiled));
    term::parse(&boot_text)
        .map_err(|err| anyhow::anyhow!(err))
        .context("compiled instruction file does not round-trip")?;
    let boot_path = descriptor
        .version_path
        .join(format!("{sequence_name}.boot"));
    fs::write(&boot_path, boot_text)
        .with_context(|| format!("writing boot instructions '{}'", boot_path.display()))?;

    Ok(boot_path)
}

//! Low-level boot instructions and the rewriting passes applied to
//! them after compilation.

use anyhow::{bail, Context, Result};

use crate::descriptor::{BootEntry, Mode, ReleaseDescriptor, FOUNDATION_LIBRARY};
use crate::term::Term;

use super::BootError;

/// Marker the launcher substitutes with the bundle's `lib/` directory.
pub const RELEASE_LIB_MARKER: &str = "$RELEASE_LIB";

/// Target of the configuration-provider apply directive.
pub const PROVIDER_APPLY_TARGET: &str = "runtime_config.apply_providers";

/// One directive of a compiled instruction file.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Start a component under supervision.
    Start { component: String, mode: Mode },
    /// Load a component without starting it.
    Load { component: String },
    /// Install code search paths.
    SetPaths { paths: Vec<String> },
    /// Free-form apply directive.
    Apply { target: String, args: Vec<Term> },
}

impl Instruction {
    pub fn to_term(&self) -> Term {
        match self {
            Instruction::Start { component, mode } => Term::Tuple(vec![
                Term::sym("start"),
                Term::sym(component.clone()),
                Term::sym(mode.to_string()),
            ]),
            Instruction::Load { component } => {
                Term::Tuple(vec![Term::sym("load"), Term::sym(component.clone())])
            }
            Instruction::SetPaths { paths } => Term::Tuple(vec![
                Term::sym("paths"),
                Term::List(paths.iter().map(|p| Term::text(p.clone())).collect()),
            ]),
            Instruction::Apply { target, args } => Term::Tuple(vec![
                Term::sym("apply"),
                Term::text(target.clone()),
                Term::List(args.clone()),
            ]),
        }
    }
}

/// Encode an instruction list as the term written to a `.boot` file.
pub fn instructions_to_term(instructions: &[Instruction]) -> Term {
    Term::List(instructions.iter().map(Instruction::to_term).collect())
}

/// Decode a `.boot` term back into instructions. This is the reader
/// the platform itself uses, so compiled files must survive it.
pub fn instructions_from_term(term: &Term) -> Result<Vec<Instruction>> {
    let Term::List(items) = term else {
        bail!("instruction file must be a list of directives");
    };
    let mut instructions = Vec::with_capacity(items.len());
    for item in items {
        let Term::Tuple(fields) = item else {
            bail!("instruction '{item}' is not a tuple directive");
        };
        let directive = match fields.first() {
            Some(Term::Sym(tag)) => tag.as_str(),
            _ => bail!("instruction '{item}' has no directive tag"),
        };
        let instruction = match (directive, &fields[1..]) {
            ("start", [Term::Sym(component), Term::Sym(mode)]) => {
                let mode: Mode = mode.parse().map_err(|_| BootError::UnrecognizedMode {
                    component: component.clone(),
                    mode: mode.clone(),
                })?;
                Instruction::Start {
                    component: component.clone(),
                    mode,
                }
            }
            ("load", [Term::Sym(component)]) => Instruction::Load {
                component: component.clone(),
            },
            ("paths", [Term::List(paths)]) => {
                let mut collected = Vec::with_capacity(paths.len());
                for path in paths {
                    match path {
                        Term::Text(text) => collected.push(text.clone()),
                        other => bail!("path entry '{other}' is not text"),
                    }
                }
                Instruction::SetPaths { paths: collected }
            }
            ("apply", [Term::Text(target), Term::List(args)]) => Instruction::Apply {
                target: target.clone(),
                args: args.clone(),
            },
            _ => bail!("malformed directive '{item}'"),
        };
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// The external code-loading toolchain, treated as an opaque function
/// from a boot sequence to low-level instructions.
pub trait InstructionCompiler {
    fn compile(
        &self,
        descriptor: &ReleaseDescriptor,
        entries: &[BootEntry],
    ) -> Result<Vec<Instruction>>;
}

/// Built-in compiler: search paths for every sequenced component,
/// load directives for everything except `none`, then start
/// directives for the safe-mode components in sequence order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCompiler;

impl InstructionCompiler for DefaultCompiler {
    fn compile(
        &self,
        descriptor: &ReleaseDescriptor,
        entries: &[BootEntry],
    ) -> Result<Vec<Instruction>> {
        let mut paths = Vec::with_capacity(entries.len());
        for entry in entries {
            let manifest = descriptor
                .components
                .get(&entry.component)
                .with_context(|| format!("compiling boot sequence: unknown component '{}'", entry.component))?;
            paths.push(format!(
                "{RELEASE_LIB_MARKER}/{}/artifacts",
                manifest.target_dir_name()
            ));
        }

        let mut instructions = vec![Instruction::SetPaths { paths }];
        for entry in entries {
            if entry.mode != Mode::None {
                instructions.push(Instruction::Load {
                    component: entry.component.clone(),
                });
            }
        }
        for entry in entries {
            if entry.mode.is_safe() {
                instructions.push(Instruction::Start {
                    component: entry.component.clone(),
                    mode: entry.mode,
                });
            }
        }
        Ok(instructions)
    }
}

/// Splice the configuration-provider apply directive immediately
/// after the foundational-library start directive. Callers only
/// invoke this when providers are registered, so the compiled file
/// carries at most one apply directive.
pub fn splice_provider_apply(
    mut instructions: Vec<Instruction>,
    config_path: &str,
) -> Result<Vec<Instruction>> {
    let anchor = instructions
        .iter()
        .position(|instruction| {
            matches!(
                instruction,
                Instruction::Start { component, .. } if component == FOUNDATION_LIBRARY
            )
        })
        .with_context(|| {
            format!("boot sequence has no '{FOUNDATION_LIBRARY}' start directive to anchor the provider apply")
        })?;
    instructions.insert(
        anchor + 1,
        Instruction::Apply {
            target: PROVIDER_APPLY_TARGET.to_string(),
            args: vec![Term::text(config_path)],
        },
    );
    Ok(instructions)
}

/// Prepend caller-supplied search paths to every path directive that
/// references the parameterized release-library marker. A parent
/// coordination layer uses this to inject dynamically located
/// dependency paths ahead of the bundled ones.
pub fn prepend_search_paths(
    mut instructions: Vec<Instruction>,
    extra: &[String],
) -> Vec<Instruction> {
    if extra.is_empty() {
        return instructions;
    }
    for instruction in &mut instructions {
        if let Instruction::SetPaths { paths } = instruction {
            if paths.iter().any(|path| path.contains(RELEASE_LIB_MARKER)) {
                let mut merged = extra.to_vec();
                merged.append(paths);
                *paths = merged;
            }
        }
    }
    instructions
}

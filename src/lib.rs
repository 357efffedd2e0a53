//! Infrastructure for assembling self-contained release bundles from
//! compiled components.
//!
//! Given a project's root requirements, the pipeline:
//!
//! - **Resolves** the transitive component closure, merging lifecycle
//!   modes requested along different paths
//! - **Builds** deterministic boot sequences and compiles them into
//!   low-level instruction files
//! - **Merges** static and provider-contributed runtime configuration
//!   into one validated artifact
//! - **Packages** every component's compiled artifacts into the
//!   bundle tree, stripping and optionally compressing them
//!
//! # Architecture
//!
//! ```text
//! release.toml ──▶ ReleaseDescriptor
//!                      │
//!        graph::resolve (ManifestStore)
//!                      │
//!        boot::build_sequences ──▶ *.seq / *.boot
//!                      │
//!        config::build_runtime_config ──▶ runtime.config
//!                      │
//!        package::copy_component ──▶ lib/<name>-<vsn>/
//! ```
//!
//! Each pipeline step is a function from one descriptor value to the
//! next; file-system effects are isolated and idempotent. The
//! [`manifest::ManifestStore`] and [`boot::InstructionCompiler`]
//! traits keep resolution and instruction rewriting testable without
//! disk or toolchain.

pub mod boot;
pub mod config;
pub mod descriptor;
pub mod graph;
pub mod manifest;
pub mod object;
pub mod package;
pub mod pipeline;
pub mod project;
pub mod term;

pub use boot::{BootError, BootScriptResult, DefaultCompiler, Instruction, InstructionCompiler};
pub use config::{ConfigError, RuntimeConfig, Value};
pub use descriptor::{
    BootEntry, DescriptorError, Mode, ProviderSpec, ReleaseDescriptor, ReleaseOptions, StripOption,
};
pub use graph::{merge_mode, resolve, GraphError};
pub use manifest::{ComponentManifest, DiskManifestStore, ManifestStore, MemoryManifestStore};
pub use object::{ObjectError, ObjectFile};
pub use pipeline::{AssembleEnv, Runner, Stage, Step};
pub use project::{load_project, LoadedProject};
pub use term::Term;

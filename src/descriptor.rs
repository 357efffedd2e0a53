//! The release descriptor and its supporting value types.
//!
//! A [`ReleaseDescriptor`] is created once from project configuration
//! and then threaded through the pipeline; every step consumes a
//! descriptor and returns the next version of it. Nothing here touches
//! the file system.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::manifest::ComponentManifest;
use crate::pipeline::{validate_steps, Step};
use crate::term::Term;

/// Runtime kernel component. Always started permanent, first in every
/// sequence, and the component key under which the configuration
/// provider bootstrap entry is recorded.
pub const RUNTIME_COMPONENT: &str = "core_rt";

/// Foundational library component. The configuration-provider apply
/// directive is spliced immediately after its start directive.
pub const FOUNDATION_LIBRARY: &str = "base_lib";

/// Components every release carries, started `permanent` even in the
/// clean boot sequence.
pub const FOUNDATION_COMPONENTS: [&str; 2] = [RUNTIME_COMPONENT, FOUNDATION_LIBRARY];

/// How a component is started or loaded when the bundle boots.
///
/// `permanent`, `transient` and `temporary` are the "safe" modes: the
/// component is started and supervised. `load` and `none` are unsafe:
/// the component is at most loaded. `included` marks a sub-component
/// started as part of its parent and never merges with other modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Permanent,
    Transient,
    Temporary,
    Load,
    None,
    Included,
}

impl Mode {
    /// Started and supervised at boot.
    pub fn is_safe(self) -> bool {
        matches!(self, Mode::Permanent | Mode::Transient | Mode::Temporary)
    }

    /// At most loaded, never started.
    pub fn is_unsafe(self) -> bool {
        matches!(self, Mode::Load | Mode::None)
    }

    /// Merge precedence among the non-included modes. `included` has
    /// no rank; it never merges.
    pub(crate) fn rank(self) -> Option<u8> {
        match self {
            Mode::Permanent => Some(4),
            Mode::Transient => Some(3),
            Mode::Temporary => Some(2),
            Mode::Load => Some(1),
            Mode::None => Some(0),
            Mode::Included => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Permanent => "permanent",
            Mode::Transient => "transient",
            Mode::Temporary => "temporary",
            Mode::Load => "load",
            Mode::None => "none",
            Mode::Included => "included",
        };
        write!(f, "{name}")
    }
}

/// Raised when a mode string is not one of the six recognized values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized lifecycle mode '{0}'")]
pub struct UnknownModeError(pub String);

impl FromStr for Mode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Mode::Permanent),
            "transient" => Ok(Mode::Transient),
            "temporary" => Ok(Mode::Temporary),
            "load" => Ok(Mode::Load),
            "none" => Ok(Mode::None),
            "included" => Ok(Mode::Included),
            other => Err(UnknownModeError(other.to_string())),
        }
    }
}

/// One slot of a boot sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub component: String,
    pub mode: Mode,
}

impl BootEntry {
    pub fn new(component: impl Into<String>, mode: Mode) -> Self {
        Self {
            component: component.into(),
            mode,
        }
    }
}

/// A configuration provider reference plus its init term, in the order
/// providers run at boot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSpec {
    pub name: String,
    pub init: Term,
}

/// Controls the compiled-object stripping stage of the packager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripOption {
    /// Byte-copy artifacts untouched.
    Disabled,
    /// Strip, retaining the fixed minimal chunk set plus `keep`.
    Enabled { keep: Vec<String> },
}

impl Default for StripOption {
    fn default() -> Self {
        StripOption::Enabled { keep: Vec::new() }
    }
}

/// Release options. Typed knobs the pipeline consults, plus a
/// free-form `extra` table passed through from project configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOptions {
    pub strip: StripOption,
    /// Gzip-compress stripped compiled objects.
    pub compress_artifacts: bool,
    /// Defer distributed startup until configuration providers ran.
    pub reboot_after_config: bool,
    /// Start distribution during the configuration boot phase even
    /// when `reboot_after_config` is set.
    pub start_distribution_during_config: bool,
    /// Validate compile-time-captured configuration keys at boot.
    pub validate_compile_env: bool,
    /// Prune runtime-only configuration after the first boot.
    pub prune_runtime_config: bool,
    /// Components exempt from boot-order mode validation.
    pub skip_mode_checks_for: Vec<String>,
    /// Bundle the platform runtime into the release.
    pub include_platform_runtime: bool,
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            strip: StripOption::default(),
            compress_artifacts: false,
            reboot_after_config: false,
            start_distribution_during_config: false,
            validate_compile_env: true,
            prune_runtime_config: false,
            skip_mode_checks_for: Vec::new(),
            include_platform_runtime: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Rejected before any file is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("invalid release name '{0}': expected lowercase start, alphanumeric plus underscore")]
    InvalidName(String),
    #[error("release version must not be empty")]
    EmptyVersion,
    #[error("pipeline steps must contain exactly one assemble stage")]
    MissingAssemble,
    #[error("pipeline steps contain more than one assemble stage")]
    DuplicateAssemble,
    #[error("pipeline steps contain more than one tar stage")]
    DuplicateTar,
    #[error("the tar stage must not precede the assemble stage")]
    TarBeforeAssemble,
}

/// The central data model of the pipeline.
#[derive(Debug, Clone)]
pub struct ReleaseDescriptor {
    pub name: String,
    pub version: String,
    /// Bundle output root.
    pub root: PathBuf,
    /// `root/releases/<version>`, where boot and config files land.
    pub version_path: PathBuf,
    /// Ordered root requirements, as requested by the project.
    pub root_requirements: Vec<(String, Mode)>,
    /// Mode overrides; a pinned component never re-expands.
    pub mode_overrides: BTreeMap<String, Mode>,
    /// Resolved component map, populated by the graph loader.
    pub components: BTreeMap<String, ComponentManifest>,
    /// Sequence name to ordered boot entries.
    pub boot_sequences: BTreeMap<String, Vec<BootEntry>>,
    pub config_providers: Vec<ProviderSpec>,
    pub options: ReleaseOptions,
    /// Overlay files copied into the bundle root, relative paths kept.
    pub overlays: Vec<PathBuf>,
    pub steps: Vec<Step>,
}

impl ReleaseDescriptor {
    /// Validate name, version and step list up front; everything else
    /// starts empty and is filled in by pipeline steps.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        root: PathBuf,
        steps: Vec<Step>,
    ) -> Result<Self, DescriptorError> {
        let name = name.into();
        let version = version.into();
        if !Term::is_valid_symbol(&name) {
            return Err(DescriptorError::InvalidName(name));
        }
        if version.trim().is_empty() {
            return Err(DescriptorError::EmptyVersion);
        }
        validate_steps(&steps)?;
        let version_path = root.join("releases").join(&version);
        Ok(Self {
            name,
            version,
            root,
            version_path,
            root_requirements: Vec::new(),
            mode_overrides: BTreeMap::new(),
            components: BTreeMap::new(),
            boot_sequences: BTreeMap::new(),
            config_providers: Vec::new(),
            options: ReleaseOptions::default(),
            overlays: Vec::new(),
            steps,
        })
    }

    /// `root/lib`, where packaged components land.
    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    /// Bundled platform runtime directory for `platform_version`.
    pub fn runtime_dir(&self, platform_version: &str) -> PathBuf {
        self.root.join(format!("runtime-{platform_version}"))
    }

    /// Root requirements with the foundation components prepended as
    /// `permanent` when the project did not list them.
    pub fn effective_roots(&self) -> Vec<(String, Mode)> {
        let mut roots: Vec<(String, Mode)> = Vec::new();
        for name in FOUNDATION_COMPONENTS {
            if !self.root_requirements.iter().any(|(n, _)| n == name) {
                roots.push((name.to_string(), Mode::Permanent));
            }
        }
        roots.extend(self.root_requirements.iter().cloned());
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn assemble_only() -> Vec<Step> {
        vec![Step::Named(Stage::Assemble)]
    }

    #[test]
    fn test_mode_classification() {
        assert!(Mode::Permanent.is_safe());
        assert!(Mode::Transient.is_safe());
        assert!(Mode::Temporary.is_safe());
        assert!(Mode::Load.is_unsafe());
        assert!(Mode::None.is_unsafe());
        assert!(!Mode::Included.is_safe());
        assert!(!Mode::Included.is_unsafe());
    }

    #[test]
    fn test_mode_parse_display_roundtrip() {
        for mode in [
            Mode::Permanent,
            Mode::Transient,
            Mode::Temporary,
            Mode::Load,
            Mode::None,
            Mode::Included,
        ] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!(
            "standby".parse::<Mode>(),
            Err(UnknownModeError("standby".to_string()))
        );
    }

    #[test]
    fn test_descriptor_rejects_bad_names() {
        for bad in ["", "Gateway", "1st", "has-dash", "has space"] {
            let err = ReleaseDescriptor::new(bad, "1.0.0", PathBuf::from("/tmp/x"), assemble_only())
                .unwrap_err();
            assert_eq!(err, DescriptorError::InvalidName(bad.to_string()));
        }
    }

    #[test]
    fn test_descriptor_rejects_empty_version() {
        let err = ReleaseDescriptor::new("gateway", "  ", PathBuf::from("/tmp/x"), assemble_only())
            .unwrap_err();
        assert_eq!(err, DescriptorError::EmptyVersion);
    }

    #[test]
    fn test_version_path_layout() {
        let descriptor = ReleaseDescriptor::new(
            "gateway",
            "1.4.0",
            PathBuf::from("/bundles/gateway"),
            assemble_only(),
        )
        .unwrap();
        assert_eq!(
            descriptor.version_path,
            PathBuf::from("/bundles/gateway/releases/1.4.0")
        );
        assert_eq!(descriptor.lib_dir(), PathBuf::from("/bundles/gateway/lib"));
    }

    #[test]
    fn test_effective_roots_prepend_foundation() {
        let mut descriptor = ReleaseDescriptor::new(
            "gateway",
            "1.0.0",
            PathBuf::from("/tmp/x"),
            assemble_only(),
        )
        .unwrap();
        descriptor.root_requirements = vec![("gateway_core".to_string(), Mode::Permanent)];
        let roots = descriptor.effective_roots();
        assert_eq!(
            roots,
            vec![
                ("core_rt".to_string(), Mode::Permanent),
                ("base_lib".to_string(), Mode::Permanent),
                ("gateway_core".to_string(), Mode::Permanent),
            ]
        );

        // Explicitly listed foundation components are not duplicated.
        descriptor.root_requirements = vec![
            ("core_rt".to_string(), Mode::Permanent),
            ("gateway_core".to_string(), Mode::Transient),
        ];
        let roots = descriptor.effective_roots();
        assert_eq!(roots.len(), 3);
        assert_eq!(roots[0].0, "base_lib");
    }

    #[test]
    fn test_default_options() {
        let options = ReleaseOptions::default();
        assert_eq!(options.strip, StripOption::Enabled { keep: Vec::new() });
        assert!(options.validate_compile_env);
        assert!(!options.reboot_after_config);
        assert!(!options.compress_artifacts);
    }
}

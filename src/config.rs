//! Runtime configuration merging.
//!
//! Static configuration plus the registered configuration providers
//! become a single validated configuration artifact. Providers run at
//! boot; what the merger installs is their bootstrap entry under the
//! runtime component, including the deferred-startup fragment when
//! distributed startup must wait for configuration
//! (`reboot_after_config`).
//!
//! The artifact carries literal values only. Validation enumerates
//! every offending (component, key, value) triple, and the written
//! file is round-tripped through the platform's own reader before it
//! is accepted.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::descriptor::{ReleaseDescriptor, RUNTIME_COMPONENT};
use crate::term::{self, Term};

/// File name of the configuration artifact inside the version path.
pub const RUNTIME_CONFIG_FILE: &str = "runtime.config";

/// A runtime configuration value. Mirrors [`Term`], plus `Opaque` for
/// runtime-only references that must never reach the written artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Sym(String),
    Text(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// A runtime-only reference (a callback handle, an open resource).
    /// Not a literal; rejected by validation.
    Opaque(String),
}

impl Value {
    pub fn sym(name: impl Into<String>) -> Value {
        Value::Sym(name.into())
    }

    pub fn text(value: impl Into<String>) -> Value {
        Value::Text(value.into())
    }

    /// Encode as a term, or `None` when the value (or anything nested
    /// in it) is opaque.
    pub fn to_term(&self) -> Option<Term> {
        match self {
            Value::Int(v) => Some(Term::Int(*v)),
            Value::Float(v) => Some(Term::Float(*v)),
            Value::Bool(v) => Some(Term::Bool(*v)),
            Value::Sym(v) => Some(Term::Sym(v.clone())),
            Value::Text(v) => Some(Term::Text(v.clone())),
            Value::List(items) => Some(Term::List(
                items.iter().map(Value::to_term).collect::<Option<_>>()?,
            )),
            Value::Tuple(items) => Some(Term::Tuple(
                items.iter().map(Value::to_term).collect::<Option<_>>()?,
            )),
            Value::Opaque(_) => None,
        }
    }

    pub fn from_term(term: &Term) -> Value {
        match term {
            Term::Int(v) => Value::Int(*v),
            Term::Float(v) => Value::Float(*v),
            Term::Bool(v) => Value::Bool(*v),
            Term::Sym(v) => Value::Sym(v.clone()),
            Term::Text(v) => Value::Text(v.clone()),
            Term::List(items) => Value::List(items.iter().map(Value::from_term).collect()),
            Term::Tuple(items) => Value::Tuple(items.iter().map(Value::from_term).collect()),
        }
    }

    /// True when the value encodes to a term that survives the
    /// platform reader unchanged.
    fn round_trips(&self) -> bool {
        match self.to_term() {
            None => false,
            Some(term) => {
                let text = term.to_string();
                term::parse(&text).as_ref() == Ok(&term)
            }
        }
    }
}

/// Configuration entries for one component, in first-seen key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentConfig {
    pub component: String,
    pub entries: Vec<(String, Value)>,
}

impl ComponentConfig {
    pub fn new(component: impl Into<String>, entries: Vec<(String, Value)>) -> Self {
        Self {
            component: component.into(),
            entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value)
    }

    fn to_value(&self) -> Value {
        Value::Tuple(vec![
            Value::sym(self.component.clone()),
            Value::List(
                self.entries
                    .iter()
                    .map(|(key, value)| Value::Tuple(vec![Value::sym(key.clone()), value.clone()]))
                    .collect(),
            ),
        ])
    }
}

/// The full configuration artifact: an ordered list of per-component
/// entry lists.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeConfig {
    pub components: Vec<ComponentConfig>,
}

/// An offending (component, key, value) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffendingValue {
    pub component: String,
    pub key: String,
    pub value: String,
}

fn render_offenders(offenders: &[OffendingValue]) -> String {
    let mut out = String::new();
    for (i, offender) in offenders.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(
            out,
            "{}.{} = {}",
            offender.component, offender.key, offender.value
        );
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration contains non-literal values: {}", render_offenders(.0))]
    NonLiteral(Vec<OffendingValue>),
}

impl RuntimeConfig {
    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components
            .iter()
            .find(|component| component.component == name)
    }

    /// Collect every entry that is not a literal or does not survive
    /// the platform reader.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut offenders = Vec::new();
        for component in &self.components {
            for (key, value) in &component.entries {
                if !value.round_trips() {
                    offenders.push(OffendingValue {
                        component: component.component.clone(),
                        key: key.clone(),
                        value: format!("{value:?}"),
                    });
                }
            }
        }
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::NonLiteral(offenders))
        }
    }

    /// Validate, then encode the artifact as a term.
    pub fn to_term(&self) -> Result<Term, ConfigError> {
        self.validate()?;
        Ok(Term::List(
            self.components
                .iter()
                .map(|component| {
                    component
                        .to_value()
                        .to_term()
                        .expect("validated: all values literal")
                })
                .collect(),
        ))
    }

    pub fn from_term(term: &Term) -> Result<RuntimeConfig> {
        let Term::List(items) = term else {
            bail!("runtime configuration must be a list of (component, entries) tuples");
        };
        let mut components = Vec::with_capacity(items.len());
        for item in items {
            let Term::Tuple(fields) = item else {
                bail!("configuration entry '{item}' is not a tuple");
            };
            let [Term::Sym(component), Term::List(entries)] = fields.as_slice() else {
                bail!("configuration entry '{item}' is not (component, [(key, value)])");
            };
            let mut parsed = Vec::with_capacity(entries.len());
            for entry in entries {
                let Term::Tuple(pair) = entry else {
                    bail!("configuration value '{entry}' is not a (key, value) tuple");
                };
                let [Term::Sym(key), value] = pair.as_slice() else {
                    bail!("configuration value '{entry}' is not (key, value)");
                };
                parsed.push((key.clone(), Value::from_term(value)));
            }
            components.push(ComponentConfig::new(component.clone(), parsed));
        }
        Ok(RuntimeConfig { components })
    }
}

/// Merge `overlay` into `base`: overlay values win on key collision,
/// component order and first-seen key order are preserved.
pub fn merge(base: RuntimeConfig, overlay: RuntimeConfig) -> RuntimeConfig {
    let mut merged = base;
    for component in overlay.components {
        match merged
            .components
            .iter_mut()
            .find(|existing| existing.component == component.component)
        {
            Some(existing) => {
                for (key, value) in component.entries {
                    match existing
                        .entries
                        .iter_mut()
                        .find(|(existing_key, _)| *existing_key == key)
                    {
                        Some(slot) => slot.1 = value,
                        None => existing.entries.push((key, value)),
                    }
                }
            }
            None => merged.components.push(component),
        }
    }
    merged
}

fn distribution_fragment(start: bool) -> ComponentConfig {
    ComponentConfig::new(
        RUNTIME_COMPONENT,
        vec![("start_distribution".to_string(), Value::Bool(start))],
    )
}

/// Build the provider bootstrap entry installed under the runtime
/// component: the ordered provider list, the provider configuration
/// path, the validation options, and the deferred fragment.
fn provider_bootstrap(
    descriptor: &ReleaseDescriptor,
    provider_config_path: &str,
    deferred: Option<&ComponentConfig>,
    reboot: bool,
) -> ComponentConfig {
    let options = &descriptor.options;
    let providers = Value::List(
        descriptor
            .config_providers
            .iter()
            .map(|provider| {
                Value::Tuple(vec![
                    Value::sym(provider.name.clone()),
                    Value::from_term(&provider.init),
                ])
            })
            .collect(),
    );

    let mut entries = vec![
        ("config_providers".to_string(), providers),
        (
            "config_path".to_string(),
            Value::text(provider_config_path),
        ),
        (
            "validate_compile_env".to_string(),
            Value::Bool(options.validate_compile_env),
        ),
        (
            "prune_after_boot".to_string(),
            Value::Bool(options.prune_runtime_config),
        ),
        ("reboot_after_config".to_string(), Value::Bool(reboot)),
    ];

    if options.validate_compile_env {
        let captured: Vec<Value> = descriptor
            .components
            .values()
            .filter(|manifest| !manifest.env_keys.is_empty())
            .map(|manifest| {
                Value::Tuple(vec![
                    Value::sym(manifest.name.clone()),
                    Value::List(
                        manifest
                            .env_keys
                            .iter()
                            .map(|key| Value::text(key.clone()))
                            .collect(),
                    ),
                ])
            })
            .collect();
        entries.push(("compile_env_keys".to_string(), Value::List(captured)));
    }

    if let Some(fragment) = deferred {
        entries.push(("deferred_config".to_string(), Value::List(vec![fragment.to_value()])));
    }

    ComponentConfig::new(RUNTIME_COMPONENT, entries)
}

/// Merge static configuration with the registered configuration
/// providers. Returns the final configuration and the reboot flag.
///
/// Without providers the static configuration passes through
/// unchanged. With providers, distributed startup is deferred when
/// `reboot_after_config` is set and early distribution was not
/// explicitly requested: the first boot phase disables it and the
/// deferred fragment re-enables it after configuration ran.
pub fn build_runtime_config(
    descriptor: &ReleaseDescriptor,
    static_config: RuntimeConfig,
    provider_config_path: &str,
) -> Result<(RuntimeConfig, bool)> {
    if descriptor.config_providers.is_empty() {
        return Ok((static_config, false));
    }

    let options = &descriptor.options;
    let reboot = options.reboot_after_config;
    let defer_distribution = reboot && !options.start_distribution_during_config;
    let deferred = defer_distribution.then(|| distribution_fragment(true));

    let bootstrap = provider_bootstrap(descriptor, provider_config_path, deferred.as_ref(), reboot);
    let mut merged = merge(
        static_config,
        RuntimeConfig {
            components: vec![bootstrap],
        },
    );
    if defer_distribution {
        merged = merge(
            merged,
            RuntimeConfig {
                components: vec![distribution_fragment(false)],
            },
        );
    }

    merged.validate()?;
    Ok((merged, reboot))
}

/// Write the configuration artifact, rejecting anything that does not
/// round-trip through the platform reader.
pub fn write_runtime_config(
    config: &RuntimeConfig,
    path: &Path,
    deferred_active: bool,
) -> Result<()> {
    let encoded = config.to_term()?;
    let body = format!(
        "# runtime configuration\n# deferred configuration active: {deferred_active}\n{encoded}\n"
    );
    let reread = term::parse(&body)
        .map_err(|err| anyhow::anyhow!(err))
        .with_context(|| format!("runtime configuration does not round-trip ('{}')", path.display()))?;
    if reread != encoded {
        bail!(
            "runtime configuration changed across a reader round-trip ('{}')",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory '{}'", parent.display()))?;
    }
    fs::write(path, body)
        .with_context(|| format!("writing runtime configuration '{}'", path.display()))
}

/// Read a configuration artifact (or a static configuration file).
pub fn read_runtime_config(path: &Path) -> Result<RuntimeConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading runtime configuration '{}'", path.display()))?;
    let term = term::parse(&raw)
        .map_err(|err| anyhow::anyhow!(err))
        .with_context(|| format!("parsing runtime configuration '{}'", path.display()))?;
    RuntimeConfig::from_term(&term)
        .with_context(|| format!("decoding runtime configuration '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Mode, ProviderSpec, ReleaseDescriptor};
    use crate::manifest::ComponentManifest;
    use crate::pipeline::{Stage, Step};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn descriptor(providers: usize) -> ReleaseDescriptor {
        let mut descriptor = ReleaseDescriptor::new(
            "gateway",
            "1.0.0",
            PathBuf::from("/tmp/bundle"),
            vec![Step::Named(Stage::Assemble)],
        )
        .unwrap();
        for i in 0..providers {
            descriptor.config_providers.push(ProviderSpec {
                name: format!("provider_{i}"),
                init: Term::List(vec![Term::Tuple(vec![
                    Term::sym("path"),
                    Term::text(format!("/etc/provider_{i}.toml")),
                ])]),
            });
        }
        descriptor
    }

    fn static_config() -> RuntimeConfig {
        RuntimeConfig {
            components: vec![ComponentConfig::new(
                "gateway_core",
                vec![
                    ("port".to_string(), Value::Int(8080)),
                    ("bind".to_string(), Value::text("0.0.0.0")),
                ],
            )],
        }
    }

    #[test]
    fn test_static_config_passes_through_without_providers() {
        let (config, reboot) =
            build_runtime_config(&descriptor(0), static_config(), "releases/1.0.0/provider.toml")
                .unwrap();
        assert_eq!(config, static_config());
        assert!(!reboot);
    }

    #[test]
    fn test_deferred_distribution_fragments() {
        // Scenario: two providers, reboot_after_config = true,
        // start_distribution_during_config = false.
        let mut descriptor = descriptor(2);
        descriptor.options.reboot_after_config = true;

        let (config, reboot) =
            build_runtime_config(&descriptor, static_config(), "releases/1.0.0/provider.toml")
                .unwrap();
        assert!(reboot);

        let runtime = config.component(RUNTIME_COMPONENT).unwrap();
        assert_eq!(runtime.get("start_distribution"), Some(&Value::Bool(false)));

        let Some(Value::List(deferred)) = runtime.get("deferred_config") else {
            panic!("missing deferred fragment");
        };
        let expected = distribution_fragment(true).to_value();
        assert_eq!(deferred.as_slice(), &[expected]);
    }

    #[test]
    fn test_early_distribution_suppresses_fragments() {
        let mut descriptor = descriptor(1);
        descriptor.options.reboot_after_config = true;
        descriptor.options.start_distribution_during_config = true;

        let (config, reboot) =
            build_runtime_config(&descriptor, static_config(), "releases/1.0.0/provider.toml")
                .unwrap();
        assert!(reboot);
        let runtime = config.component(RUNTIME_COMPONENT).unwrap();
        assert_eq!(runtime.get("start_distribution"), None);
        assert_eq!(runtime.get("deferred_config"), None);
    }

    #[test]
    fn test_bootstrap_wins_on_key_collision() {
        let mut stale = static_config();
        stale.components.push(ComponentConfig::new(
            RUNTIME_COMPONENT,
            vec![("config_path".to_string(), Value::text("stale"))],
        ));
        let (config, _) =
            build_runtime_config(&descriptor(1), stale, "releases/1.0.0/provider.toml").unwrap();
        assert_eq!(
            config.component(RUNTIME_COMPONENT).unwrap().get("config_path"),
            Some(&Value::text("releases/1.0.0/provider.toml"))
        );
    }

    #[test]
    fn test_compile_env_keys_collected() {
        let mut descriptor = descriptor(1);
        let mut manifest =
            ComponentManifest::new("kernel_net", "1.0.0", PathBuf::from("/src/kernel_net"));
        manifest.mode = Mode::Permanent;
        manifest.env_keys = vec!["NET_BACKEND".to_string()];
        descriptor.components.insert(manifest.name.clone(), manifest);

        let (config, _) =
            build_runtime_config(&descriptor, RuntimeConfig::default(), "p.toml").unwrap();
        let runtime = config.component(RUNTIME_COMPONENT).unwrap();
        let Some(Value::List(captured)) = runtime.get("compile_env_keys") else {
            panic!("missing compile env keys");
        };
        assert_eq!(
            captured.as_slice(),
            &[Value::Tuple(vec![
                Value::sym("kernel_net"),
                Value::List(vec![Value::text("NET_BACKEND")]),
            ])]
        );
    }

    #[test]
    fn test_non_literal_values_all_enumerated() {
        let mut descriptor = descriptor(1);
        descriptor.options.reboot_after_config = false;
        let config = RuntimeConfig {
            components: vec![
                ComponentConfig::new(
                    "gateway_core",
                    vec![
                        ("callback".to_string(), Value::Opaque("fn handle/2".to_string())),
                        ("port".to_string(), Value::Int(8080)),
                        (
                            "nested".to_string(),
                            Value::List(vec![Value::Opaque("socket".to_string())]),
                        ),
                    ],
                ),
                ComponentConfig::new(
                    "metrics",
                    vec![("sink".to_string(), Value::Sym("Not-A-Symbol".to_string()))],
                ),
            ],
        };
        let err = build_runtime_config(&descriptor, config, "p.toml").unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        let ConfigError::NonLiteral(offenders) = config_err;
        let keys: Vec<&str> = offenders.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["callback", "nested", "sink"]);
        assert!(offenders.iter().all(|o| !o.value.is_empty()));
    }

    #[test]
    fn test_written_config_round_trips() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(2);
        descriptor.options.reboot_after_config = true;
        let (config, reboot) =
            build_runtime_config(&descriptor, static_config(), "releases/1.0.0/provider.toml")
                .unwrap();

        let path = temp.path().join("releases/1.0.0").join(RUNTIME_CONFIG_FILE);
        write_runtime_config(&config, &path, reboot).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# runtime configuration\n# deferred configuration active: true\n"));

        let reread = read_runtime_config(&path).unwrap();
        assert_eq!(reread, config);
    }

    #[test]
    fn test_merge_preserves_order() {
        let base = RuntimeConfig {
            components: vec![
                ComponentConfig::new("a", vec![("x".to_string(), Value::Int(1))]),
                ComponentConfig::new("b", vec![("y".to_string(), Value::Int(2))]),
            ],
        };
        let overlay = RuntimeConfig {
            components: vec![
                ComponentConfig::new(
                    "b",
                    vec![
                        ("y".to_string(), Value::Int(20)),
                        ("z".to_string(), Value::Int(30)),
                    ],
                ),
                ComponentConfig::new("c", vec![("w".to_string(), Value::Int(3))]),
            ],
        };
        let merged = merge(base, overlay);
        let names: Vec<&str> = merged
            .components
            .iter()
            .map(|component| component.component.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(merged.component("b").unwrap().get("y"), Some(&Value::Int(20)));
        assert_eq!(merged.component("b").unwrap().get("z"), Some(&Value::Int(30)));
    }
}

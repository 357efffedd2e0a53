//! Mode-compatibility validation of a boot sequence.

use std::collections::BTreeMap;

use crate::descriptor::{BootEntry, Mode};
use crate::manifest::ComponentManifest;

use super::BootError;

/// Validate `entries` against the resolved component map.
///
/// Components listed in `skip` are exempt from validation as parents.
/// Every required, non-optional child must appear somewhere in the
/// sequence, and a safe-mode parent must not depend on a child that
/// will not be started or loaded.
pub fn validate_boot_order(
    resolved: &BTreeMap<String, ComponentManifest>,
    entries: &[BootEntry],
    skip: &[String],
) -> Result<(), BootError> {
    let sequenced: BTreeMap<&str, Mode> = entries
        .iter()
        .map(|entry| (entry.component.as_str(), entry.mode))
        .collect();

    for entry in entries {
        if skip.iter().any(|name| name == &entry.component) {
            continue;
        }
        let manifest = resolved
            .get(&entry.component)
            .ok_or_else(|| BootError::UnknownComponent(entry.component.clone()))?;

        for dependency in &manifest.requires {
            if manifest.optional.contains(dependency) {
                continue;
            }
            let Some(dependency_mode) = sequenced.get(dependency.as_str()) else {
                return Err(BootError::DanglingDependency {
                    component: entry.component.clone(),
                    dependency: dependency.clone(),
                });
            };
            if entry.mode.is_safe() && dependency_mode.is_unsafe() {
                return Err(BootError::UnsafeModeCombination {
                    component: entry.component.clone(),
                    component_mode: entry.mode,
                    dependency: dependency.clone(),
                    dependency_mode: *dependency_mode,
                });
            }
        }
    }
    Ok(())
}

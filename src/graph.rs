//! Component graph loader: transitive closure resolution with
//! lifecycle-mode merging.
//!
//! Resolution runs an explicit work-list over (name, requested mode)
//! pairs with a map from name to the current manifest. A component is
//! re-expanded only when a merge actually changes its mode, which is
//! what terminates cyclic dependency graphs.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use thiserror::Error;

use crate::descriptor::Mode;
use crate::manifest::{ComponentManifest, ManifestStore};

/// Fatal resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("component '{0}' is required but no manifest could be located")]
    Unresolved(String),
    #[error("mode conflict on component '{name}': {detail}")]
    ModeConflict { name: String, detail: String },
}

/// Merge two requested modes for the same component.
///
/// Identity on equality; `included` never merges with another mode;
/// otherwise the higher-precedence mode wins, any safe mode above any
/// unsafe one, and `load` above `none`. Commutative and idempotent.
pub fn merge_mode(a: Mode, b: Mode) -> Result<Mode, GraphError> {
    if a == b {
        return Ok(a);
    }
    match (a.rank(), b.rank()) {
        (Some(rank_a), Some(rank_b)) => Ok(if rank_a >= rank_b { a } else { b }),
        _ => {
            let other = if a == Mode::Included { b } else { a };
            Err(GraphError::ModeConflict {
                name: String::new(),
                detail: format!("'included' on one path, '{other}' on another"),
            })
        }
    }
}

struct WorkItem {
    name: String,
    mode: Mode,
    /// The edge to this item was declared optional.
    optional: bool,
    /// Parent that listed this item as an included sub-component.
    includer: Option<String>,
}

/// Resolve the transitive closure of `roots`.
///
/// `overrides` pin a component's mode permanently: applied when the
/// component is first located and left untouched on every later
/// request. Optional dependencies whose manifest cannot be located
/// are skipped; required ones raise [`GraphError::Unresolved`].
pub fn resolve(
    roots: &[(String, Mode)],
    overrides: &BTreeMap<String, Mode>,
    store: &dyn ManifestStore,
) -> Result<BTreeMap<String, ComponentManifest>> {
    let mut queue: VecDeque<WorkItem> = roots
        .iter()
        .map(|(name, mode)| WorkItem {
            name: name.clone(),
            mode: *mode,
            optional: false,
            includer: None,
        })
        .collect();
    let mut resolved: BTreeMap<String, ComponentManifest> = BTreeMap::new();
    let mut included_by: BTreeMap<String, String> = BTreeMap::new();

    while let Some(item) = queue.pop_front() {
        // A component may be included by at most one parent.
        if let Some(includer) = &item.includer {
            match included_by.get(&item.name) {
                Some(first) if first != includer => {
                    return Err(GraphError::ModeConflict {
                        name: item.name.clone(),
                        detail: format!("included by both '{first}' and '{includer}'"),
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    included_by.insert(item.name.clone(), includer.clone());
                }
            }
        }

        if let Some(existing_mode) = resolved.get(&item.name).map(|manifest| manifest.mode) {
            if overrides.contains_key(&item.name) {
                continue;
            }
            let merged = merge_mode(existing_mode, item.mode).map_err(|err| match err {
                GraphError::ModeConflict { detail, .. } => GraphError::ModeConflict {
                    name: item.name.clone(),
                    detail,
                },
                other => other,
            })?;
            if merged == existing_mode {
                continue;
            }
            let manifest = resolved
                .get_mut(&item.name)
                .expect("present: just looked up");
            manifest.mode = merged;
            let manifest = manifest.clone();
            enqueue_children(&mut queue, &manifest);
        } else {
            let Some(mut manifest) = store.load(&item.name)? else {
                if item.optional {
                    continue;
                }
                return Err(GraphError::Unresolved(item.name).into());
            };
            manifest.mode = overrides.get(&item.name).copied().unwrap_or(item.mode);
            enqueue_children(&mut queue, &manifest);
            resolved.insert(item.name.clone(), manifest);
        }
    }

    Ok(resolved)
}

fn enqueue_children(queue: &mut VecDeque<WorkItem>, manifest: &ComponentManifest) {
    // Children of an included parent are merely loaded.
    let child_mode = if manifest.mode == Mode::Included {
        Mode::Load
    } else {
        manifest.mode
    };
    for name in &manifest.requires {
        queue.push_back(WorkItem {
            name: name.clone(),
            mode: child_mode,
            optional: manifest.optional.contains(name),
            includer: None,
        });
    }
    for name in &manifest.included {
        queue.push_back(WorkItem {
            name: name.clone(),
            mode: Mode::Included,
            optional: false,
            includer: Some(manifest.name.clone()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MemoryManifestStore;
    use std::path::PathBuf;

    const ALL_MODES: [Mode; 6] = [
        Mode::Permanent,
        Mode::Transient,
        Mode::Temporary,
        Mode::Load,
        Mode::None,
        Mode::Included,
    ];

    fn component(name: &str) -> ComponentManifest {
        ComponentManifest::new(name, "1.0.0", PathBuf::from(format!("/src/{name}")))
    }

    fn store_of(manifests: Vec<ComponentManifest>) -> MemoryManifestStore {
        let mut store = MemoryManifestStore::new();
        for manifest in manifests {
            store.insert(manifest);
        }
        store
    }

    fn graph_err(err: anyhow::Error) -> GraphError {
        err.downcast_ref::<GraphError>()
            .expect("expected a GraphError")
            .clone()
    }

    #[test]
    fn test_merge_mode_commutative_and_idempotent() {
        for a in ALL_MODES {
            assert_eq!(merge_mode(a, a).unwrap(), a);
            for b in ALL_MODES {
                match (merge_mode(a, b), merge_mode(b, a)) {
                    (Ok(x), Ok(y)) => assert_eq!(x, y),
                    (Err(_), Err(_)) => {}
                    (x, y) => panic!("merge asymmetry for {a}/{b}: {x:?} vs {y:?}"),
                }
            }
        }
    }

    #[test]
    fn test_merge_mode_precedence() {
        assert_eq!(
            merge_mode(Mode::Permanent, Mode::Temporary).unwrap(),
            Mode::Permanent
        );
        assert_eq!(
            merge_mode(Mode::Transient, Mode::Temporary).unwrap(),
            Mode::Transient
        );
        assert_eq!(merge_mode(Mode::Temporary, Mode::Load).unwrap(), Mode::Temporary);
        assert_eq!(merge_mode(Mode::None, Mode::Load).unwrap(), Mode::Load);
        assert_eq!(
            merge_mode(Mode::None, Mode::Permanent).unwrap(),
            Mode::Permanent
        );
    }

    #[test]
    fn test_merge_mode_rejects_included() {
        for other in ALL_MODES {
            if other == Mode::Included {
                continue;
            }
            assert!(merge_mode(Mode::Included, other).is_err());
            assert!(merge_mode(other, Mode::Included).is_err());
        }
    }

    #[test]
    fn test_unlisted_dependency_inherits_root_mode() {
        // Scenario: roots [(a, permanent)], a requires b.
        let mut a = component("a");
        a.requires = vec!["b".to_string()];
        let store = store_of(vec![a, component("b")]);

        let resolved = resolve(
            &[("a".to_string(), Mode::Permanent)],
            &BTreeMap::new(),
            &store,
        )
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["a"].mode, Mode::Permanent);
        assert_eq!(resolved["b"].mode, Mode::Permanent);
    }

    #[test]
    fn test_mode_supremum_across_paths() {
        // c is reached as load via d and as permanent via a -> b.
        let mut d = component("d");
        d.requires = vec!["c".to_string()];
        let mut a = component("a");
        a.requires = vec!["b".to_string()];
        let mut b = component("b");
        b.requires = vec!["c".to_string()];
        let store = store_of(vec![a, b, component("c"), d]);

        let resolved = resolve(
            &[
                ("d".to_string(), Mode::Load),
                ("a".to_string(), Mode::Permanent),
            ],
            &BTreeMap::new(),
            &store,
        )
        .unwrap();
        assert_eq!(resolved["d"].mode, Mode::Load);
        assert_eq!(resolved["c"].mode, Mode::Permanent);
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let mut a = component("a");
        a.requires = vec!["b".to_string()];
        let mut b = component("b");
        b.requires = vec!["a".to_string()];
        let store = store_of(vec![a, b]);

        let resolved = resolve(
            &[("a".to_string(), Mode::Transient)],
            &BTreeMap::new(),
            &store,
        )
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["b"].mode, Mode::Transient);
    }

    #[test]
    fn test_included_by_two_parents_conflicts() {
        // Scenario: b included by both a (permanent) and c (load).
        let mut a = component("a");
        a.included = vec!["b".to_string()];
        let mut c = component("c");
        c.included = vec!["b".to_string()];
        let store = store_of(vec![a, component("b"), c]);

        let err = resolve(
            &[
                ("a".to_string(), Mode::Permanent),
                ("c".to_string(), Mode::Load),
            ],
            &BTreeMap::new(),
            &store,
        )
        .unwrap_err();
        match graph_err(err) {
            GraphError::ModeConflict { name, .. } => assert_eq!(name, "b"),
            other => panic!("expected mode conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_included_and_required_conflicts() {
        let mut a = component("a");
        a.included = vec!["b".to_string()];
        let mut c = component("c");
        c.requires = vec!["b".to_string()];
        let store = store_of(vec![a, component("b"), c]);

        let err = resolve(
            &[
                ("a".to_string(), Mode::Permanent),
                ("c".to_string(), Mode::Permanent),
            ],
            &BTreeMap::new(),
            &store,
        )
        .unwrap_err();
        match graph_err(err) {
            GraphError::ModeConflict { name, .. } => assert_eq!(name, "b"),
            other => panic!("expected mode conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_override_pins_mode() {
        let mut a = component("a");
        a.requires = vec!["b".to_string()];
        let store = store_of(vec![a, component("b")]);
        let overrides = BTreeMap::from([("b".to_string(), Mode::Load)]);

        let resolved = resolve(
            &[("a".to_string(), Mode::Permanent)],
            &overrides,
            &store,
        )
        .unwrap();
        assert_eq!(resolved["b"].mode, Mode::Load);
    }

    #[test]
    fn test_missing_optional_dependency_is_skipped() {
        let mut a = component("a");
        a.requires = vec!["b".to_string(), "metrics".to_string()];
        a.optional = vec!["metrics".to_string()];
        let store = store_of(vec![a, component("b")]);

        let resolved = resolve(
            &[("a".to_string(), Mode::Permanent)],
            &BTreeMap::new(),
            &store,
        )
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(!resolved.contains_key("metrics"));
    }

    #[test]
    fn test_missing_required_dependency_fails() {
        let mut a = component("a");
        a.requires = vec!["ghost".to_string()];
        let store = store_of(vec![a]);

        let err = resolve(
            &[("a".to_string(), Mode::Permanent)],
            &BTreeMap::new(),
            &store,
        )
        .unwrap_err();
        assert_eq!(graph_err(err), GraphError::Unresolved("ghost".to_string()));
    }

    #[test]
    fn test_included_parent_children_are_loaded() {
        let mut a = component("a");
        a.included = vec!["b".to_string()];
        let mut b = component("b");
        b.requires = vec!["c".to_string()];
        let store = store_of(vec![a, b, component("c")]);

        let resolved = resolve(
            &[("a".to_string(), Mode::Permanent)],
            &BTreeMap::new(),
            &store,
        )
        .unwrap();
        assert_eq!(resolved["b"].mode, Mode::Included);
        assert_eq!(resolved["c"].mode, Mode::Load);
    }
}

//! Artifact packaging: populate the on-disk bundle from the resolved
//! component map.
//!
//! Compiled objects pass through the stripping stage, manifests are
//! re-serialized through the canonical formatter, everything else is
//! byte-copied with permissions preserved so embedded executables
//! stay executable.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::descriptor::{ReleaseDescriptor, StripOption};
use crate::manifest::canonical_manifest_text;
use crate::object::{strip_object_file, OBJECT_EXTENSION};

/// Sub-directories copied for every component.
const COMPONENT_SUBDIRS: [&str; 3] = ["artifacts", "priv", "include"];

/// Launcher script name inside the bundled runtime's `bin/`.
pub const LAUNCHER_FILE: &str = "launch";

/// Copy one resolved component into `root/lib/<name>-<version>/`.
///
/// Returns `false` when the component directory is unavailable and
/// the component is platform-provided: with no platform runtime
/// bundled that is a skip, not an error.
pub fn copy_component(descriptor: &ReleaseDescriptor, name: &str) -> Result<bool> {
    let manifest = descriptor
        .components
        .get(name)
        .with_context(|| format!("packaging unknown component '{name}'"))?;

    if !manifest.dir.is_dir() {
        if manifest.platform_provided {
            return Ok(false);
        }
        bail!(
            "component '{}' has no artifacts at '{}'",
            name,
            manifest.dir.display()
        );
    }

    let target_root = descriptor.lib_dir().join(manifest.target_dir_name());
    for subdir in COMPONENT_SUBDIRS {
        copy_artifact_directory(
            descriptor,
            &manifest.dir.join(subdir),
            &target_root.join(subdir),
        )?;
    }
    Ok(true)
}

/// Copy every resolved component; returns the names that were skipped
/// as unavailable platform-provided components.
pub fn package_components(descriptor: &ReleaseDescriptor) -> Result<Vec<String>> {
    let mut skipped = Vec::new();
    for name in descriptor.components.keys() {
        if !copy_component(descriptor, name)? {
            skipped.push(name.clone());
        }
    }
    Ok(skipped)
}

/// Copy an artifact tree into the bundle. Returns `false` when the
/// source directory does not exist.
pub fn copy_artifact_directory(
    descriptor: &ReleaseDescriptor,
    source: &Path,
    target: &Path,
) -> Result<bool> {
    if !source.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(target)
        .with_context(|| format!("creating artifact target '{}'", target.display()))?;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry
            .with_context(|| format!("walking artifact directory '{}'", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir stays under its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("creating directory '{}'", dest.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)
                    .with_context(|| format!("replacing symlink '{}'", dest.display()))?;
            }
            std::os::unix::fs::symlink(&link, &dest)
                .with_context(|| format!("creating symlink '{}'", dest.display()))?;
        } else {
            copy_artifact_file(descriptor, entry.path(), &dest)?;
        }
    }
    Ok(true)
}

fn copy_artifact_file(descriptor: &ReleaseDescriptor, source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }

    let file_name = source.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if file_name == "component.toml" {
        let raw = fs::read_to_string(source)
            .with_context(|| format!("reading manifest '{}'", source.display()))?;
        let canonical = canonical_manifest_text(&raw)
            .with_context(|| format!("normalizing manifest '{}'", source.display()))?;
        fs::write(dest, canonical)
            .with_context(|| format!("writing manifest '{}'", dest.display()))?;
        return Ok(());
    }

    let is_object = source.extension().and_then(|e| e.to_str()) == Some(OBJECT_EXTENSION);
    if is_object {
        if let StripOption::Enabled { keep } = &descriptor.options.strip {
            // Stripping failures degrade to a byte copy.
            if strip_object_file(source, dest, keep, descriptor.options.compress_artifacts).is_ok()
            {
                let permissions = fs::metadata(source)
                    .with_context(|| format!("reading metadata '{}'", source.display()))?
                    .permissions();
                fs::set_permissions(dest, permissions)
                    .with_context(|| format!("setting permissions '{}'", dest.display()))?;
                return Ok(());
            }
        }
    }

    fs::copy(source, dest).with_context(|| {
        format!(
            "copying artifact '{}' to '{}'",
            source.display(),
            dest.display()
        )
    })?;
    Ok(())
}

/// Copy overlay files into the bundle root, preserving their paths
/// relative to `overlay_root`.
pub fn copy_overlays(descriptor: &ReleaseDescriptor, overlay_root: &Path) -> Result<()> {
    for overlay in &descriptor.overlays {
        if overlay.is_absolute() {
            bail!(
                "overlay path '{}' must be relative to the project",
                overlay.display()
            );
        }
        let source = overlay_root.join(overlay);
        if !source.is_file() {
            bail!("overlay file '{}' not found", source.display());
        }
        let dest = descriptor.root.join(overlay);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating overlay directory '{}'", parent.display()))?;
        }
        fs::copy(&source, &dest).with_context(|| {
            format!(
                "copying overlay '{}' to '{}'",
                source.display(),
                dest.display()
            )
        })?;
    }
    Ok(())
}

/// Bundle the platform runtime: copy its `bin/` and regenerate the
/// launcher script.
pub fn copy_platform_runtime(
    descriptor: &ReleaseDescriptor,
    platform_root: &Path,
    platform_version: &str,
) -> Result<()> {
    let source_bin = platform_root.join("bin");
    let target_bin = descriptor.runtime_dir(platform_version).join("bin");
    if source_bin.is_dir() {
        copy_artifact_directory(descriptor, &source_bin, &target_bin)?;
    } else {
        fs::create_dir_all(&target_bin)
            .with_context(|| format!("creating runtime bin '{}'", target_bin.display()))?;
    }
    write_launcher(descriptor, &target_bin)
}

/// Regenerate the launcher. The single file under the do-not-overwrite
/// -if-unchanged policy: rewritten only when the content differs.
fn write_launcher(descriptor: &ReleaseDescriptor, bin_dir: &Path) -> Result<()> {
    let script = format!(
        "#!/bin/sh\n\
         # {name} {version} launcher (regenerated at assembly)\n\
         ROOT=\"$(cd \"$(dirname \"$0\")/../..\" && pwd)\"\n\
         export RELEASE_ROOT=\"$ROOT\"\n\
         export RELEASE_LIB=\"$ROOT/lib\"\n\
         SEQUENCE=\"${{RELEASE_SEQUENCE:-start}}\"\n\
         exec runtime_exec \\\n\
         \x20   --boot \"$ROOT/releases/{version}/$SEQUENCE.boot\" \\\n\
         \x20   --config \"$ROOT/releases/{version}/runtime.config\" \\\n\
         \x20   \"$@\"\n",
        name = descriptor.name,
        version = descriptor.version,
    );

    let launcher = bin_dir.join(LAUNCHER_FILE);
    if let Ok(existing) = fs::read_to_string(&launcher) {
        if existing == script {
            return Ok(());
        }
    }
    fs::write(&launcher, script)
        .with_context(|| format!("writing launcher '{}'", launcher.display()))?;
    fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("setting launcher permissions '{}'", launcher.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ComponentManifest;
    use crate::object::{Chunk, ObjectFile};
    use crate::pipeline::{Stage, Step};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn object_bytes() -> Vec<u8> {
        ObjectFile::new(vec![
            Chunk::new("Code", vec![1, 2, 3]),
            Chunk::new("Docs", b"docs".to_vec()),
            Chunk::new("Debug", vec![9; 32]),
        ])
        .to_bytes()
    }

    fn component_fixture(temp: &TempDir, name: &str) -> ComponentManifest {
        let dir = temp.path().join(format!("build/{name}-1.0.0"));
        let artifacts = dir.join("artifacts");
        fs::create_dir_all(&artifacts).unwrap();
        fs::write(artifacts.join(format!("{name}.rmod")), object_bytes()).unwrap();
        fs::write(
            artifacts.join("component.toml"),
            format!("[component]\nversion = \"1.0.0\"\nname = \"{name}\"\n"),
        )
        .unwrap();
        let private = dir.join("priv");
        fs::create_dir_all(&private).unwrap();
        fs::write(private.join("helper.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(
            private.join("helper.sh"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        ComponentManifest::new(name, "1.0.0", dir)
    }

    fn descriptor(temp: &TempDir) -> ReleaseDescriptor {
        ReleaseDescriptor::new(
            "gateway",
            "1.0.0",
            temp.path().join("bundle"),
            vec![Step::Named(Stage::Assemble)],
        )
        .unwrap()
    }

    #[test]
    fn test_copy_component_strips_and_copies() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        let manifest = component_fixture(&temp, "gateway_core");
        descriptor
            .components
            .insert("gateway_core".to_string(), manifest);

        assert!(copy_component(&descriptor, "gateway_core").unwrap());

        let target = descriptor.root.join("lib/gateway_core-1.0.0");
        let object =
            ObjectFile::parse(&fs::read(target.join("artifacts/gateway_core.rmod")).unwrap())
                .unwrap();
        assert!(object.chunk("Code").is_some());
        assert!(object.chunk("Debug").is_none());
        assert!(object.chunk("Docs").is_none());

        // Manifest is canonicalized, not byte-copied.
        let manifest_text = fs::read_to_string(target.join("artifacts/component.toml")).unwrap();
        assert!(manifest_text.contains("name = \"gateway_core\""));

        // Executables stay executable.
        let mode = fs::metadata(target.join("priv/helper.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_strip_disabled_copies_bytes_verbatim() {
        // Scenario: strip = false keeps even discardable chunks.
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        descriptor.options.strip = StripOption::Disabled;
        let manifest = component_fixture(&temp, "gateway_core");
        descriptor
            .components
            .insert("gateway_core".to_string(), manifest);

        copy_component(&descriptor, "gateway_core").unwrap();
        let copied = fs::read(
            descriptor
                .root
                .join("lib/gateway_core-1.0.0/artifacts/gateway_core.rmod"),
        )
        .unwrap();
        assert_eq!(copied, object_bytes());
    }

    #[test]
    fn test_strip_keep_option_preserves_extra_chunks() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        descriptor.options.strip = StripOption::Enabled {
            keep: vec!["Docs".to_string()],
        };
        let manifest = component_fixture(&temp, "gateway_core");
        descriptor
            .components
            .insert("gateway_core".to_string(), manifest);

        copy_component(&descriptor, "gateway_core").unwrap();
        let object = ObjectFile::parse(
            &fs::read(
                descriptor
                    .root
                    .join("lib/gateway_core-1.0.0/artifacts/gateway_core.rmod"),
            )
            .unwrap(),
        )
        .unwrap();
        assert!(object.chunk("Docs").is_some());
        assert!(object.chunk("Debug").is_none());
    }

    #[test]
    fn test_corrupt_object_degrades_to_byte_copy() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        let manifest = component_fixture(&temp, "gateway_core");
        let corrupt = manifest.dir.join("artifacts/gateway_core.rmod");
        fs::write(&corrupt, b"not an object at all").unwrap();
        descriptor
            .components
            .insert("gateway_core".to_string(), manifest);

        copy_component(&descriptor, "gateway_core").unwrap();
        let copied = fs::read(
            descriptor
                .root
                .join("lib/gateway_core-1.0.0/artifacts/gateway_core.rmod"),
        )
        .unwrap();
        assert_eq!(copied, b"not an object at all");
    }

    #[test]
    fn test_missing_platform_component_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        let mut manifest = ComponentManifest::new(
            "core_rt",
            "2.0",
            temp.path().join("platform/lib/core_rt-2.0"),
        );
        manifest.platform_provided = true;
        descriptor.components.insert("core_rt".to_string(), manifest);

        assert!(!copy_component(&descriptor, "core_rt").unwrap());
        let skipped = package_components(&descriptor).unwrap();
        assert_eq!(skipped, vec!["core_rt".to_string()]);
    }

    #[test]
    fn test_missing_local_component_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        let manifest =
            ComponentManifest::new("gateway_core", "1.0.0", temp.path().join("missing"));
        descriptor
            .components
            .insert("gateway_core".to_string(), manifest);

        assert!(copy_component(&descriptor, "gateway_core").is_err());
    }

    #[test]
    fn test_copy_overlays_preserves_relative_paths() {
        let temp = TempDir::new().unwrap();
        let mut descriptor = descriptor(&temp);
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("etc")).unwrap();
        fs::write(project.join("etc/motd"), "welcome\n").unwrap();
        descriptor.overlays = vec![PathBuf::from("etc/motd")];

        copy_overlays(&descriptor, &project).unwrap();
        assert_eq!(
            fs::read_to_string(descriptor.root.join("etc/motd")).unwrap(),
            "welcome\n"
        );
    }

    #[test]
    fn test_launcher_written_once_unless_changed() {
        let temp = TempDir::new().unwrap();
        let descriptor = descriptor(&temp);
        let platform = temp.path().join("platform");
        fs::create_dir_all(platform.join("bin")).unwrap();
        fs::write(platform.join("bin/runtime_exec"), b"\x7fELF...").unwrap();

        copy_platform_runtime(&descriptor, &platform, "27.1").unwrap();
        let launcher = descriptor.runtime_dir("27.1").join("bin").join(LAUNCHER_FILE);
        let mode = fs::metadata(&launcher).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
        assert!(fs::read_to_string(&launcher).unwrap().contains("releases/1.0.0"));

        // Unchanged content is not rewritten: demote permissions and
        // re-run; a rewrite would restore 0755.
        fs::set_permissions(&launcher, fs::Permissions::from_mode(0o644)).unwrap();
        copy_platform_runtime(&descriptor, &platform, "27.1").unwrap();
        let mode = fs::metadata(&launcher).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}

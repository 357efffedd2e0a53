use std::path::Path;

use anyhow::{bail, Result};
use release_builder::boot::DefaultCompiler;
use release_builder::pipeline::Runner;
use release_builder::project::load_project;

fn usage() -> &'static str {
    "Usage:\n  release-builder assemble <release.toml>\n  release-builder resolve <release.toml>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [command, config] if command == "assemble" => assemble(Path::new(config)),
        [command, config] if command == "resolve" => resolve(Path::new(config)),
        _ => bail!(usage()),
    }
}

fn assemble(config: &Path) -> Result<()> {
    let project = load_project(config)?;
    let name = project.descriptor.name.clone();
    let version = project.descriptor.version.clone();
    println!("[assemble] {name} {version}");

    let runner = Runner {
        store: &project.store,
        compiler: &DefaultCompiler,
        env: project.env,
        static_config: project.static_config,
    };
    let descriptor = runner.run(project.descriptor)?;

    println!(
        "[assemble] {} components into '{}'",
        descriptor.components.len(),
        descriptor.root.display()
    );
    Ok(())
}

fn resolve(config: &Path) -> Result<()> {
    let project = load_project(config)?;
    let descriptor = &project.descriptor;
    let resolved = release_builder::graph::resolve(
        &descriptor.effective_roots(),
        &descriptor.mode_overrides,
        &project.store,
    )?;
    for (name, manifest) in &resolved {
        println!("{name}-{} {}", manifest.version, manifest.mode);
    }
    Ok(())
}

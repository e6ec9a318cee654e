mod backup;
mod cli;
mod registry;
mod run;
mod schema;
mod settings;
mod util;

use anyhow::Context;
use registry::{PluginDefinition, PluginRegistry};
use run::{RunEvent, TaskCoordinator};
use settings::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .init();

    let settings = Settings::load();
    let registry = PluginRegistry::new(Path::new("tasks"))
        .with_extension(settings.script_extension.clone());

    let opts = cli::get_opts();
    match opts.subcommand.as_str() {
        "list" => {
            registry.ensure_root()?;
            let plugins = registry.discover();
            if plugins.is_empty() {
                println!(
                    "No task folders found under {:?}. Create one subdirectory per task, \
                     each containing a {} script.",
                    registry.root(),
                    settings.script_extension
                );
            }
            for plugin in &plugins {
                let script = plugin
                    .script
                    .as_deref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "script not found".to_string());
                println!("{:<24} {:<24} {}", plugin.name, plugin.display_name, script);
            }
        }
        "docs" => {
            let plugin = find_plugin(&registry, opts.task.as_deref())?;
            match &plugin.docs {
                Some(docs) => println!("{}", docs),
                None => println!("No README found for '{}'.", plugin.name),
            }
        }
        "run" => {
            let plugin = find_plugin(&registry, opts.task.as_deref())?;
            let files: Vec<PathBuf> = opts.files.iter().map(PathBuf::from).collect();
            if files.is_empty() {
                eprintln!("Warning: no input files were provided; running anyway.");
            }
            run_task(plugin, files, &settings).await?;
        }
        other => {
            eprintln!("Unknown subcommand: {} (supported: list, docs, run)", other);
        }
    }

    Ok(())
}

fn find_plugin(
    registry: &PluginRegistry,
    task: Option<&str>,
) -> anyhow::Result<PluginDefinition> {
    let name = task.context("missing task name")?;
    registry
        .discover()
        .into_iter()
        .find(|p| p.name == name)
        .with_context(|| format!("no task named '{}' under {:?}", name, registry.root()))
}

async fn run_task(
    plugin: PluginDefinition,
    files: Vec<PathBuf>,
    settings: &Settings,
) -> anyhow::Result<()> {
    let coordinator = Arc::new(TaskCoordinator::new(plugin, settings));
    let mut rx = coordinator.run(files, true)?;

    // Ctrl+C requests cooperative cancellation; the terminal event still
    // arrives through the channel.
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("Received Ctrl+C, cancelling run");
            let _ = coordinator.cancel();
        });
    }

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Line(line) | RunEvent::Notice(line) => println!("{}", line),
            RunEvent::Finished(outcome) => {
                println!("{}", outcome.message());
                if !outcome.is_success() {
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

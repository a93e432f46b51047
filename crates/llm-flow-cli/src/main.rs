// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! llm-flow CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use llm_flow_core::{Engine, Registry, Severity, Workflow, SCHEMA_TAG};
use llm_flow_providers::register_from_env;
use std::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "llm-flow")]
#[command(version, about = "Declarative AI workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a single workflow file
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
    },

    /// List workflows under a registry root
    List {
        /// Registry root directory
        #[arg(value_name = "DIR", default_value = "config/workflows")]
        dir: String,
    },

    /// Run a workflow
    Run {
        /// Registry root directory
        #[arg(long, default_value = "config/workflows")]
        dir: String,

        /// Workflow registry name (path relative to the root, no extension)
        #[arg(value_name = "NAME")]
        name: String,

        /// Input text (defaults to empty)
        #[arg(short, long, default_value = "")]
        input: String,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llm_flow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file, strict } => validate_workflow(&file, strict),
        Commands::List { dir } => list_workflows(&dir),
        Commands::Run {
            dir,
            name,
            input,
            json,
        } => run_workflow(&dir, &name, &input, json).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn validate_workflow(file_path: &str, strict: bool) -> Result<()> {
    info!("Validating workflow: {}", file_path);
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read workflow file: {}", file_path))?;

    let mut workflow: Workflow = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse workflow YAML: {}", file_path))?;

    anyhow::ensure!(
        workflow.schema == SCHEMA_TAG,
        "unsupported schema tag '{}' (this engine supports '{}')",
        workflow.schema,
        SCHEMA_TAG
    );

    let mut diagnostics = workflow.expand_env();
    diagnostics.extend(llm_flow_core::validate::validate(&workflow));

    for diagnostic in &diagnostics {
        match diagnostic.severity {
            Severity::Error => println!("  {} {}", "error:".red().bold(), diagnostic),
            Severity::Warning => println!("  {} {}", "warning:".yellow().bold(), diagnostic),
            Severity::Info => println!("  {} {}", "note:".dimmed(), diagnostic),
        }
    }

    if llm_flow_core::validate::has_blocking(&diagnostics, strict) {
        anyhow::bail!("workflow '{}' failed validation", workflow.name);
    }

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Loops: {}", workflow.loops.len());
    Ok(())
}

fn list_workflows(dir: &str) -> Result<()> {
    let registry =
        Registry::load(dir).with_context(|| format!("Failed to load registry from {}", dir))?;

    let names = registry.list();
    println!(
        "{} {} ({} workflows)",
        "Registry:".cyan().bold(),
        dir,
        names.len()
    );
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

async fn run_workflow(dir: &str, name: &str, input: &str, json: bool) -> Result<()> {
    let registry =
        Registry::load(dir).with_context(|| format!("Failed to load registry from {}", dir))?;
    let engine = register_from_env(Engine::new(registry));

    // Ctrl-C cancels cooperatively; in-flight provider calls are aborted.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    println!("{} {}", "Running workflow:".cyan().bold(), name);
    let outcome = engine
        .run(name, input, cancel)
        .await
        .with_context(|| format!("Workflow '{}' failed", name))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    for diagnostic in &outcome.diagnostics {
        if diagnostic.severity == Severity::Warning {
            println!("  {} {}", "warning:".yellow().bold(), diagnostic);
        }
    }

    println!("{}", "Step outputs:".cyan().bold());
    for (step, output) in &outcome.step_outputs {
        let provider = outcome
            .provider_used
            .get(step)
            .map(|p| format!(" ({})", p))
            .unwrap_or_default();
        println!("  {}{}: {}", step.bold(), provider.dimmed(), truncate(output, 120));
    }

    match &outcome.failure {
        Some(failure) => {
            println!("{} {}", "✗ Run failed:".red().bold(), failure);
            std::process::exit(2);
        }
        None => {
            println!("{}", "✓ Run completed".green().bold());
            println!("{}", outcome.final_output);
        }
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}…", cut)
    }
}

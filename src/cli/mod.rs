//! Command-line interface for weft.
//!
//! Provides commands for running pipelines, resuming paused runs, checking
//! status, inspecting event history, and reporting token usage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::backend::{CommandBackend, GenerationBackend};
use crate::core::{ExecutorConfig, PipelineExecutor};
use crate::domain::{PipelineTemplate, RunStatus};
use crate::storage::StorageManager;

/// weft - Event-sourced multi-step generation pipeline runner
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Workspace to operate in (isolated storage per workspace)
    #[arg(short, long, default_value = "default", global = true)]
    pub workspace: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline template
    Run {
        /// Path to the template YAML file
        template: PathBuf,

        /// Pipeline inputs as key=value pairs (values parsed as JSON when
        /// possible, kept as strings otherwise)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Maximum steps executing concurrently
        #[arg(short, long, default_value = "4")]
        concurrency: usize,
    },

    /// Resume a paused run, supplying values for its waiting steps
    Resume {
        /// Run ID (UUID)
        run_id: String,

        /// Path to the template YAML file the run was started from
        template: PathBuf,

        /// Values for waiting steps as step_key=value pairs
        #[arg(short, long = "value", value_name = "STEP=VALUE")]
        values: Vec<String>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the event history of a run
    Events {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show aggregate token usage for the workspace
    Usage,

    /// Manage stored pipeline templates
    Templates {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// Validate a template file and store it in the workspace
    Add {
        /// Path to the template YAML file
        template: PathBuf,
    },

    /// List stored templates
    List,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let workspace = self.workspace;
        match self.command {
            Commands::Run {
                template,
                inputs,
                concurrency,
            } => run_pipeline(&workspace, &template, &inputs, concurrency).await,
            Commands::Resume {
                run_id,
                template,
                values,
            } => resume_run(&workspace, &run_id, &template, &values).await,
            Commands::Status { run_id } => show_status(&workspace, &run_id),
            Commands::Runs { limit } => list_runs(&workspace, limit),
            Commands::Events { run_id } => show_events(&workspace, &run_id),
            Commands::Usage => show_usage(&workspace),
            Commands::Templates { command } => match command {
                TemplateCommands::Add { template } => add_template(&workspace, &template),
                TemplateCommands::List => list_templates(&workspace),
            },
        }
    }
}

fn open_executor(workspace: &str) -> Result<PipelineExecutor> {
    let storage = Arc::new(
        StorageManager::open(workspace)
            .with_context(|| format!("Failed to open workspace '{}'", workspace))?,
    );
    let backend: Arc<dyn GenerationBackend> =
        Arc::new(CommandBackend::from_env().context("Failed to configure backend")?);
    Ok(PipelineExecutor::new(storage, backend))
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Split a `key=value` argument. Values that parse as JSON become typed
/// values (numbers, booleans); everything else stays a string.
fn parse_inputs(pairs: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut inputs = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        inputs.insert(key.to_string(), parsed);
    }
    Ok(inputs)
}

fn parse_values(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected STEP=VALUE, got '{}'", pair))?;
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

/// Run a template end to end and print the final outputs.
async fn run_pipeline(
    workspace: &str,
    template_path: &PathBuf,
    input_pairs: &[String],
    concurrency: usize,
) -> Result<()> {
    let template = PipelineTemplate::from_file(template_path)
        .with_context(|| format!("Failed to load template: {}", template_path.display()))?;
    let inputs = parse_inputs(input_pairs)?;

    let executor = open_executor(workspace)?.with_config(ExecutorConfig {
        concurrency_limit: concurrency,
    });
    let run = executor.execute(&template, inputs).await?;

    print_outputs(&template, &run.outputs);
    match run.status {
        RunStatus::Completed => {
            eprintln!("\n[Run {} completed successfully]", run.id);
        }
        RunStatus::Paused => {
            eprintln!(
                "\n[Run {} paused awaiting input; resume with `weft resume {}`]",
                run.id, run.id
            );
        }
        RunStatus::Failed => {
            eprintln!(
                "\n[Run {} failed: {}]",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} in state: {:?}]", run.id, other);
        }
    }

    Ok(())
}

async fn resume_run(
    workspace: &str,
    run_id_str: &str,
    template_path: &PathBuf,
    value_pairs: &[String],
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let template = PipelineTemplate::from_file(template_path)
        .with_context(|| format!("Failed to load template: {}", template_path.display()))?;
    let values = parse_values(value_pairs)?;

    let executor = open_executor(workspace)?;
    let run = executor.resume(run_id, &template, values).await?;

    print_outputs(&template, &run.outputs);
    match run.status {
        RunStatus::Completed => {
            eprintln!("\n[Run {} completed successfully]", run.id);
        }
        RunStatus::Failed => {
            eprintln!(
                "\n[Run {} failed: {}]",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} in state: {:?}]", run.id, other);
        }
    }

    Ok(())
}

/// Print the output of each terminal step (one no other step depends on).
fn print_outputs(template: &PipelineTemplate, outputs: &BTreeMap<String, String>) {
    let terminal: Vec<&str> = template
        .steps
        .iter()
        .filter(|s| {
            !template
                .steps
                .iter()
                .any(|other| other.depends_on.contains(&s.key))
        })
        .map(|s| s.key.as_str())
        .collect();

    for key in terminal {
        if let Some(output) = outputs.get(key) {
            println!("{}", output);
        }
    }
}

fn show_status(workspace: &str, run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let executor = open_executor(workspace)?;
    let run = executor
        .get_run(run_id)?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_id);
    println!("Workspace: {}", run.workspace);
    println!("Status: {:?}", run.status);
    println!("Created: {}", run.created_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Tokens used: {}", run.total_tokens_used);
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }

    println!("\nSteps:");
    for step in &run.steps {
        let detail = match &step.error {
            Some(e) => format!(" ({})", e),
            None => String::new(),
        };
        println!(
            "  {:<20} {:?} [retries: {}, tokens: {}]{}",
            step.step_key, step.status, step.retry_count, step.tokens_used, detail
        );
    }

    Ok(())
}

fn list_runs(workspace: &str, limit: usize) -> Result<()> {
    let executor = open_executor(workspace)?;
    let runs = executor.list_runs()?;

    if runs.is_empty() {
        println!("No runs in workspace '{}'", workspace);
        return Ok(());
    }

    for run in runs.iter().take(limit) {
        println!(
            "{}  {:<12} {:<20} {}",
            run.id,
            format!("{:?}", run.status),
            run.pipeline_id,
            run.created_at
        );
    }

    Ok(())
}

fn show_events(workspace: &str, run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let executor = open_executor(workspace)?;
    let events = executor.get_events(run_id)?;

    if events.is_empty() {
        println!("No events for run {}", run_id);
        return Ok(());
    }

    for event in events {
        let step = event
            .step_key()
            .map(|s| format!(" step={}", s))
            .unwrap_or_default();
        println!(
            "{:>4}  {}  {:?}{}",
            event.sequence, event.timestamp, event.event_type, step
        );
    }

    Ok(())
}

fn show_usage(workspace: &str) -> Result<()> {
    let executor = open_executor(workspace)?;
    let usage = executor.total_usage()?;

    println!("Workspace: {}", workspace);
    println!("Runs tracked: {}", usage.runs);
    println!("Input tokens: {}", usage.total_input_tokens);
    println!("Output tokens: {}", usage.total_output_tokens);
    println!("Total tokens: {}", usage.total_tokens());

    if !usage.by_model.is_empty() {
        println!("\nBy model:");
        for (model, counts) in &usage.by_model {
            println!(
                "  {:<24} in: {:<10} out: {}",
                model, counts.input, counts.output
            );
        }
    }

    Ok(())
}

fn add_template(workspace: &str, template_path: &PathBuf) -> Result<()> {
    let template = PipelineTemplate::from_file(template_path)
        .with_context(|| format!("Failed to load template: {}", template_path.display()))?;

    let executor = open_executor(workspace)?;
    executor.save_template(&template)?;
    println!(
        "Stored template '{}' ({} steps) in workspace '{}'",
        template.id,
        template.steps.len(),
        workspace
    );

    Ok(())
}

fn list_templates(workspace: &str) -> Result<()> {
    let executor = open_executor(workspace)?;
    let templates = executor.list_templates()?;

    if templates.is_empty() {
        println!("No templates in workspace '{}'", workspace);
        return Ok(());
    }

    for t in templates {
        println!("{:<24} v{:<8} {} steps", t.id, t.version, t.steps.len());
    }

    Ok(())
}

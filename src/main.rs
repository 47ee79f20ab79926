//! Weir CLI - DAG workflow execution engine

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use thiserror::Error;

use weir::{
    validate, EventKind, FixSuggestion, FnHandler, Graph, Handler, HandlerRegistry,
    Invocation, Outputs, Run, RunError, RunStatus, ValidatedGraph,
};

#[derive(Parser)]
#[command(name = "weir")]
#[command(about = "Weir - concurrency-bounded DAG workflow execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file with echo handlers (dry run)
    Run {
        /// Path to graph YAML file
        file: String,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,

        /// Override the concurrency budget
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Validate a graph file without executing it
    Validate {
        /// Path to graph YAML file
        file: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] weir::ConfigError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl CliError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            CliError::Config(e) | CliError::Run(RunError::Config(e)) => e.fix_suggestion(),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            json,
            concurrency,
        } => run_graph(&file, json, concurrency).await,
        Commands::Validate { file } => validate_graph(&file),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load(file: &str) -> Result<ValidatedGraph, CliError> {
    let yaml = std::fs::read_to_string(file)?;
    let graph = Graph::from_yaml(&yaml)?;
    Ok(validate(&graph)?)
}

fn validate_graph(file: &str) -> Result<(), CliError> {
    let validated = load(file)?;

    println!("{} Graph '{}' is valid", "✓".green(), file);
    println!("  Nodes: {}", validated.nodes().len());
    println!("  Concurrency: {}", validated.settings().concurrency);
    for node in validated.nodes() {
        let deps = validated.predecessors(&node.id);
        if deps.is_empty() {
            println!("  {} {} ({})", "·".dimmed(), node.id, node.kind.dimmed());
        } else {
            let deps: Vec<&str> = deps.iter().map(|d| d.as_ref()).collect();
            println!(
                "  {} {} ({}) {} {}",
                "·".dimmed(),
                node.id,
                node.kind.dimmed(),
                "after".dimmed(),
                deps.join(", ")
            );
        }
    }
    Ok(())
}

/// Dry-run handler: echoes the resolved inputs into every declared port
fn echo_handlers(validated: &ValidatedGraph) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let mut kinds: Vec<Arc<str>> = validated
        .nodes()
        .iter()
        .map(|n| Arc::clone(&n.kind))
        .collect();
    kinds.sort();
    kinds.dedup();

    for kind in kinds {
        let graph = validated.clone();
        let handler: Arc<dyn Handler> = Arc::new(FnHandler::new(move |inv: Invocation| {
            let graph = graph.clone();
            async move {
                let mut out = Outputs::default();
                if let Some(node) = graph.node(&inv.node_id) {
                    let inputs = serde_json::to_value(
                        inv.inputs
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.clone()))
                            .collect::<std::collections::BTreeMap<_, _>>(),
                    )
                    .unwrap_or(serde_json::Value::Null);
                    for port in &node.outputs {
                        out.insert(
                            Arc::clone(&port.name),
                            serde_json::json!({ "echo": inputs }),
                        );
                    }
                }
                Ok(out)
            }
        }));
        registry.register(kind, handler);
    }
    registry
}

async fn run_graph(
    file: &str,
    json: bool,
    concurrency: Option<usize>,
) -> Result<(), CliError> {
    let validated = load(file)?;
    let registry = echo_handlers(&validated);

    let mut settings = validated.settings().clone();
    if let Some(c) = concurrency {
        settings.concurrency = c;
    }

    let total = validated.nodes().len();
    println!("{} Running graph with {} nodes...\n", "→".cyan(), total);

    let run = Run::new(validated, registry).with_settings(settings);
    let mut feed = run.events().subscribe();
    let printer = tokio::spawn(async move {
        let mut completed = 0usize;
        while let Ok(event) = feed.recv().await {
            match event.kind {
                EventKind::NodeStarted { node_id, attempt } if attempt == 0 => {
                    println!("  {} {} {}", "[⟳]".yellow(), node_id, "running...".dimmed());
                }
                EventKind::NodeRetrying {
                    node_id,
                    attempt,
                    delay_ms,
                    ..
                } => {
                    println!(
                        "  {} {} {}",
                        "[⟳]".yellow(),
                        node_id,
                        format!("retrying (attempt {}, +{}ms)...", attempt + 1, delay_ms)
                            .dimmed()
                    );
                }
                EventKind::NodeSucceeded {
                    node_id,
                    duration_ms,
                    ..
                } => {
                    completed += 1;
                    println!(
                        "  {} {} {} {}",
                        format!("[{completed}/{total}]").green(),
                        node_id,
                        "✓".green(),
                        format!("({:.1}s)", duration_ms as f64 / 1000.0).dimmed()
                    );
                }
                EventKind::NodeFailed { node_id, error, .. } => {
                    completed += 1;
                    println!(
                        "  {} {} {}",
                        format!("[{completed}/{total}]").red(),
                        node_id,
                        "✗".red()
                    );
                    println!("      {} {}", "Error:".red(), error);
                }
                EventKind::NodeSkipped {
                    node_id,
                    failed_ancestors,
                } => {
                    completed += 1;
                    let cause = if failed_ancestors.is_empty() {
                        "cancelled".to_string()
                    } else {
                        let ids: Vec<&str> =
                            failed_ancestors.iter().map(|a| a.as_ref()).collect();
                        format!("after {}", ids.join(", "))
                    };
                    println!(
                        "  {} {} {}",
                        format!("[{completed}/{total}]").yellow(),
                        node_id,
                        format!("skipped ({cause})").dimmed()
                    );
                }
                EventKind::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let report = run.run().await?;
    let _ = printer.await;

    println!();
    match report.status {
        RunStatus::Completed => println!(
            "{} Run {} completed in {}ms",
            "✓".green(),
            report.run_id,
            report.duration_ms
        ),
        RunStatus::Failed => println!(
            "{} Run {} failed ({}ms)",
            "✗".red(),
            report.run_id,
            report.duration_ms
        ),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    }

    if report.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

use anyhow::{Context, Result};
use cascade::cascade::{lint, load_path, parse_str};
use cascade::provider::ScriptedProvider;
use cascade::trace::{JsonlSink, LineageGraph};
use cascade::{Runtime, RuntimeOptions, SessionStatus};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about = "Declarative multi-phase LLM workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a cascade definition against the hard validation rules
    Validate {
        /// Path to a .json / .yaml cascade definition
        file: PathBuf,
    },
    /// Report non-fatal findings (unknown keys, unused inputs, ...)
    Lint {
        file: PathBuf,
    },
    /// Execute a cascade
    Run {
        file: PathBuf,

        /// Inputs as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// Session id (generated when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Default model for phases without an override
        #[arg(long)]
        model: Option<String>,

        /// Use the built-in scripted provider instead of a real one
        #[arg(long)]
        dry_run: bool,

        /// Directory for JSONL trace logs
        #[arg(long, default_value = "logs")]
        logs_dir: PathBuf,

        /// Write the lineage graph JSON here after the run
        #[arg(long)]
        graph_out: Option<PathBuf>,
    },
    /// Rebuild the lineage graph of a logged session
    Graph {
        /// Directory holding JSONL trace logs
        #[arg(long, default_value = "logs")]
        logs_dir: PathBuf,

        /// Session id to export
        #[arg(long)]
        session: String,

        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "cascade=debug" } else { "cascade=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Lint { file } => cmd_lint(&file),
        Commands::Run {
            file,
            input,
            session,
            model,
            dry_run,
            logs_dir,
            graph_out,
        } => cmd_run(&file, &input, session, model, dry_run, logs_dir, graph_out).await,
        Commands::Graph {
            logs_dir,
            session,
            out,
        } => cmd_graph(&logs_dir, &session, out),
    }
}

fn cmd_validate(file: &PathBuf) -> Result<()> {
    match load_path(file) {
        Ok(config) => {
            println!(
                "{} {} ({} phase(s))",
                style("valid:").green().bold(),
                config.cascade_id,
                config.phases.len()
            );
            Ok(())
        }
        Err(error) => {
            eprintln!("{} {error}", style("invalid:").red().bold());
            std::process::exit(1);
        }
    }
}

fn cmd_lint(file: &PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let config = parse_str(&source, None).context("Failed to parse cascade definition")?;

    let warnings = lint(&config);
    if warnings.is_empty() {
        println!("{} no findings", style("clean:").green().bold());
    } else {
        for warning in &warnings {
            println!("{} {warning}", style("warning:").yellow().bold());
        }
        println!("{} finding(s)", warnings.len());
    }
    Ok(())
}

async fn cmd_run(
    file: &PathBuf,
    input: &str,
    session: Option<String>,
    model: Option<String>,
    dry_run: bool,
    logs_dir: PathBuf,
    graph_out: Option<PathBuf>,
) -> Result<()> {
    if !dry_run {
        anyhow::bail!(
            "No provider is configured for direct CLI runs. Inject one through the library \
             API (Runtime::new), or pass --dry-run to use the scripted provider."
        );
    }

    let config = load_path(file).context("Failed to load cascade definition")?;
    let inputs: serde_json::Value =
        serde_json::from_str(input).context("--input must be a JSON object")?;

    let mut options = RuntimeOptions::default().with_logs_dir(logs_dir);
    if let Some(model) = model {
        options = options.with_default_model(&model);
    }

    let provider = Arc::new(ScriptedProvider::with_fallback(
        "Dry-run response: no provider configured.",
    ));
    let runtime = Runtime::new(provider, options);

    let outcome = runtime.run_cascade(config, inputs, session).await?;

    let status_label = match outcome.status {
        SessionStatus::Ok => style(outcome.status.to_string()).green().bold(),
        _ => style(outcome.status.to_string()).red().bold(),
    };
    println!("session {} finished: {}", outcome.session_id, status_label);
    for entry in &outcome.lineage {
        let mut line = format!(
            "  {} {}",
            style(&entry.phase_name).cyan(),
            cascade::phase::value_to_text(&entry.output)
        );
        if !entry.warnings.is_empty() {
            line.push_str(&format!(" {}", style("(warnings)").yellow()));
        }
        println!("{line}");
    }
    for error in &outcome.errors {
        println!("  {} [{}] {}", style("error:").red(), error.kind, error.message);
    }
    println!(
        "  tokens: {} in / {} out, cost: ${:.4}",
        outcome.cost.tokens_in, outcome.cost.tokens_out, outcome.cost.cost
    );

    if let Some(path) = graph_out {
        let graph = runtime
            .export_graph(&outcome.session_id)
            .context("Session vanished before graph export")?;
        std::fs::write(&path, serde_json::to_string_pretty(&graph)?)
            .with_context(|| format!("Failed to write graph to {}", path.display()))?;
        println!("  lineage graph written to {}", path.display());
    }

    if outcome.status != SessionStatus::Ok {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_graph(logs_dir: &PathBuf, session: &str, out: Option<PathBuf>) -> Result<()> {
    let mut events = JsonlSink::read_session(logs_dir, session)
        .with_context(|| format!("No logs for session `{session}` under {}", logs_dir.display()))?;
    if events.is_empty() {
        anyhow::bail!("Session `{session}` has no logged events");
    }

    // Pull in descendant sessions logged alongside the root. Repeat until
    // stable so grandchildren are found whatever the directory order.
    let mut tree: Vec<String> = vec![session.to_string()];
    let mut remaining: Vec<String> = JsonlSink::list_sessions(logs_dir)
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s != session)
        .collect();
    loop {
        let mut added = false;
        remaining.retain(|other| {
            let Ok(child_events) = JsonlSink::read_session(logs_dir, other) else {
                return false;
            };
            let is_descendant = child_events.iter().any(|e| {
                e.parent_session_id
                    .as_deref()
                    .is_some_and(|p| tree.iter().any(|t| t == p))
            });
            if is_descendant {
                tree.push(other.clone());
                events.extend(child_events);
                added = true;
                return false;
            }
            true
        });
        if !added {
            break;
        }
    }

    let graph = LineageGraph::build(session, events);
    let json = serde_json::to_string_pretty(&graph)?;
    match out {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "graph: {} node(s), {} edge(s) written to {}",
                graph.summary.event_count,
                graph.edges.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

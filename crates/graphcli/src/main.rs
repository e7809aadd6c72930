use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use graphcore::{
    validator, ExecutionEvent, Graph, GraphModel, NodeEvent, NodeStatus, NodeTypeRegistry,
    PortValues, RunStatus, Value,
};
use graphruntime::{ExecutorRegistry, GraphRuntime, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graph")]
#[command(about = "Workflow graph engine CLI", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Upper bound on concurrently running nodes
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Run agent, tool, memory and integration nodes as pass-through
        #[arg(long)]
        echo_external: bool,
    },

    /// Validate a graph file
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes {
        /// Only list one category (io, agents, control, data, memory, integration, governance)
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Create an example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            max_parallel,
            echo_external,
        } => {
            let mut config = RuntimeConfig::from_env();
            if let Some(max_parallel) = max_parallel {
                config = config.with_max_parallel(max_parallel);
            }
            run_graph(&file, input, config, echo_external).await?;
        }

        Commands::Validate { file } => {
            validate_graph(&file)?;
        }

        Commands::Nodes { category } => {
            list_nodes(category.as_deref())?;
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

fn catalog() -> Result<NodeTypeRegistry> {
    let mut types = NodeTypeRegistry::new();
    graphnodes::register_definitions(&mut types)?;
    Ok(types)
}

fn load_graph(file: &Path) -> Result<Graph> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let graph = Graph::from_json(&json)
        .with_context(|| format!("{} is not a valid graph", file.display()))?;
    tracing::debug!(
        "Loaded {} with {} node(s) and {} edge(s)",
        file.display(),
        graph.nodes.len(),
        graph.edges.len()
    );
    Ok(graph)
}

fn parse_inputs(input: Option<String>) -> Result<PortValues> {
    let Some(input) = input else {
        return Ok(PortValues::new());
    };
    match serde_json::from_str::<Value>(&input)? {
        Value::Object(obj) => Ok(obj.into_iter().collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStatus { status, error, .. } => match (status, error) {
            (RunStatus::Running, _) => println!("▶️  Run started"),
            (_, Some(error)) => println!("💥 Run {}: {}", status, error),
            (status, None) if status.is_terminal() => println!("✨ Run {}", status),
            _ => {}
        },
        ExecutionEvent::NodeStatus {
            node_id,
            status,
            iteration,
            error,
            skip_reason,
            ..
        } => {
            let at = iteration.map(|i| format!(" #{}", i)).unwrap_or_default();
            match status {
                NodeStatus::Running => println!("  ⚡ {}{} running", node_id, at),
                NodeStatus::Waiting => println!("  ⏸️  {}{} awaiting approval", node_id, at),
                NodeStatus::Success => println!("  ✅ {}{} succeeded", node_id, at),
                NodeStatus::Error => println!(
                    "  ❌ {}{} failed: {}",
                    node_id,
                    at,
                    error.as_deref().unwrap_or("unknown error")
                ),
                NodeStatus::Skipped => match skip_reason {
                    Some(reason) => println!("  ⏭️  {}{} skipped ({})", node_id, at, reason),
                    None => println!("  ⏭️  {}{} skipped", node_id, at),
                },
                NodeStatus::Idle => {}
            }
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", node_id, percent);
                }
            }
            NodeEvent::Data { .. } => {}
        },
    }
}

async fn run_graph(
    file: &Path,
    input: Option<String>,
    config: RuntimeConfig,
    echo_external: bool,
) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());

    let graph = load_graph(file)?;
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    println!();

    let inputs = parse_inputs(input)?;

    let mut types = NodeTypeRegistry::new();
    let mut executors = ExecutorRegistry::new();
    graphnodes::register_all(&mut types, &mut executors)?;
    if echo_external {
        graphnodes::register_echo_for_external(&types, &mut executors);
    }
    let runtime = GraphRuntime::with_config(Arc::new(types), executors, config);

    let run_id = runtime.submit(graph, inputs).await?;
    tracing::info!("Submitted run {} from {}", run_id, file.display());
    let mut events = Box::pin(runtime.events(run_id).await?);
    while let Some(event) = events.next().await {
        print_event(&event);
    }
    let record = runtime.wait(run_id).await?;
    tracing::info!("Run {} finished: {}", run_id, record.status);

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", record.run_id);
    println!("   Status: {}", record.status);
    let done = record.nodes.values().filter(|s| s.is_terminal()).count();
    println!("   Completed: {}/{} nodes", done, record.nodes.len());

    let outputs = record.outputs();
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, value) in &outputs {
            println!("   {}: {}", node_id, value);
        }
    }

    if record.status != RunStatus::Succeeded {
        bail!(
            "run {} {}",
            record.status,
            record.error.unwrap_or_else(|| "without a result".to_string())
        );
    }
    Ok(())
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let graph = load_graph(file)?;
    let types = catalog()?;
    let issues = validator::validate(&graph, &types);
    tracing::debug!("Validation of {} reported {} issue(s)", file.display(), issues.len());

    for issue in &issues {
        println!("   {}", issue);
    }
    let errors = issues.iter().filter(|i| i.is_error()).count();
    if errors > 0 {
        bail!("graph has {} error(s)", errors);
    }

    println!("✅ Graph is valid:");
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    Ok(())
}

fn list_nodes(category: Option<&str>) -> Result<()> {
    println!("📦 Available Node Types:");
    println!();

    let types = catalog()?;
    for def in types.list(category) {
        println!("  • {} ({})", def.node_type, def.category);
        if !def.description.is_empty() {
            println!("    {}", def.description);
        }
    }
    Ok(())
}

/// Example: route on `x`, rendering a message on the `true` branch
fn example_graph() -> Result<Graph> {
    let mut model = GraphModel::new(Arc::new(catalog()?));

    let input = model.add_node("input", None)?;
    let check = model.add_node(
        "condition",
        Some([("condition".to_string(), Value::from("x > 5"))].into_iter().collect()),
    )?;
    let render = model.add_node(
        "template",
        Some([("template".to_string(), Value::from("x is big: {{x}}"))].into_iter().collect()),
    )?;
    let big = model.add_node("output", None)?;
    let small = model.add_node(
        "output",
        Some([("required".to_string(), Value::from(false))].into_iter().collect()),
    )?;

    model.connect(&input, "output", &check, "input", None)?;
    model.connect(&check, "true", &render, "input", None)?;
    model.connect(&render, "output", &big, "input", None)?;
    model.connect(&check, "false", &small, "input", None)?;

    Ok(model.into_graph())
}

fn create_example_graph(output: &Path) -> Result<()> {
    let json = example_graph()?.to_json()?;
    std::fs::write(output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  graph run --file {} --input '{{\"x\": 10}}'", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_graph_is_valid() {
        let graph = example_graph().unwrap();
        let issues = validator::validate(&graph, &catalog().unwrap());
        assert!(validator::is_runnable(&issues), "{:?}", issues);
    }

    #[test]
    fn inputs_must_be_an_object() {
        assert!(parse_inputs(Some("[1, 2]".to_string())).is_err());
        assert_eq!(parse_inputs(None).unwrap().len(), 0);
        assert_eq!(parse_inputs(Some(r#"{"x": 1}"#.to_string())).unwrap()["x"], Value::from(1));
    }

    #[tokio::test]
    async fn example_graph_runs() {
        let mut types = NodeTypeRegistry::new();
        let mut executors = ExecutorRegistry::new();
        graphnodes::register_all(&mut types, &mut executors).unwrap();
        let runtime = GraphRuntime::new(Arc::new(types), executors);

        let inputs = parse_inputs(Some(r#"{"x": 10}"#.to_string())).unwrap();
        let record = runtime.execute(example_graph().unwrap(), inputs).await.unwrap();
        assert_eq!(record.status, RunStatus::Succeeded, "{:?}", record.error);
        assert!(record
            .outputs()
            .values()
            .any(|v| v == &Value::from("x is big: 10")));
    }
}

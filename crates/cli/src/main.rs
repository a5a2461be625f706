//! Task runner CLI: validate task definitions and replay recorded data
//! through them.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strom_core::{
    point_from_json, point_to_json, BufferedBatch, EdgeType, Message, Point, TaskDefinition,
};
use strom_edge::Edge;
use strom_engine::{EngineError, ExecutingTask, Ingest, TaskContext};

#[derive(Parser, Debug)]
#[command(name = "strom")]
#[command(about = "Run and validate stream/batch processing tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a task definition file.
    Validate {
        /// Task definition (YAML or JSON).
        task: PathBuf,
    },
    /// Run a task, feeding it recorded data and printing its output.
    Run {
        /// Task definition (YAML or JSON).
        task: PathBuf,
        /// Input file: one JSON point (stream tasks) or one JSON batch
        /// (batch tasks) per line. Reads stdin when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Buffer size of the edges between nodes.
        #[arg(long, default_value_t = 1000)]
        edge_capacity: usize,
        /// Print task statistics after the run.
        #[arg(long)]
        stats: bool,
    },
}

/// Ingest sink for loopback nodes when running outside the daemon:
/// re-injected points are printed instead of redistributed.
struct PrintIngest;

#[async_trait::async_trait]
impl Ingest for PrintIngest {
    async fn write_point(&self, point: Point) -> Result<(), EngineError> {
        match point_to_json(&point) {
            Ok(json) => println!("loopback> {json}"),
            Err(e) => tracing::warn!(error = %e, "cannot render loopback point"),
        }
        Ok(())
    }
}

fn load_definition(path: &PathBuf) -> Result<TaskDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let def: TaskDefinition =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    def.validate()?;
    Ok(def)
}

async fn run_task(
    path: &PathBuf,
    input: Option<PathBuf>,
    edge_capacity: usize,
    stats: bool,
) -> Result<()> {
    let def = load_definition(path)?;
    let kind = def.kind;
    let task_id = def.id.clone();

    let ctx = TaskContext {
        edge_capacity,
        handlers: HashMap::new(),
        ingest: Some(Arc::new(PrintIngest)),
    };
    let mut task = ExecutingTask::new(def, ctx)?;
    let output = task.output();
    task.start(HashMap::new()).await?;

    let printer = output.map(|edge| {
        tokio::spawn(async move {
            while let Some(msg) = edge.emit().await {
                match msg {
                    Message::Point(p) => match point_to_json(&p) {
                        Ok(json) => println!("{json}"),
                        Err(e) => tracing::warn!(error = %e, "cannot render point"),
                    },
                    Message::BufferedBatch(b) => match b.to_json() {
                        Ok(json) => println!("{json}"),
                        Err(e) => tracing::warn!(error = %e, "cannot render batch"),
                    },
                    other => tracing::debug!(kind = %other.kind(), "output message"),
                }
            }
        })
    });

    let reader: Box<dyn BufRead> = match input {
        Some(file) => Box::new(std::io::BufReader::new(
            std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?,
        )),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };
    let mut fed = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg = match kind {
            EdgeType::Stream => Message::Point(point_from_json(line)?),
            EdgeType::Batch => Message::BufferedBatch(BufferedBatch::from_json(line)?),
        };
        task.collect(msg).await?;
        fed += 1;
    }

    let result = task.stop().await;
    if let Some(printer) = printer {
        printer.await.ok();
    }
    tracing::info!(task = %task_id, records = fed, "run complete");
    if stats {
        println!("{}", serde_json::to_string_pretty(&task.stats())?);
    }
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { task } => {
            let def = load_definition(&task)?;
            println!(
                "task {} ({}) ok: {} nodes, {} edges",
                def.id,
                def.kind,
                def.nodes.len(),
                def.edges.len()
            );
            for node in &def.nodes {
                println!("  {} [{}]", node.id, node.spec.kind_name());
            }
            Ok(())
        }
        Command::Run {
            task,
            input,
            edge_capacity,
            stats,
        } => run_task(&task, input, edge_capacity, stats).await,
    }
}

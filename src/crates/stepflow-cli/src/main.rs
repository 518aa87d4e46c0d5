//! `stepflow` CLI: drives a run against a `stepflow-orchestrator-server`
//! instance over HTTP, or inspects a flow graph file offline.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use stepflow_core::FlowGraph;

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Command-line front end for the stepflow orchestrator", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Base URL of a running `stepflow-orchestrator-server` (e.g. http://127.0.0.1:4600)
    #[arg(long, env = "STEPFLOW_SERVER", default_value = "http://127.0.0.1:4600")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and poll it to completion, printing the final state.
    Run {
        /// Flow id registered with the server.
        flow_id: String,
        /// Starting parameters as `key=value` pairs (values parsed as JSON,
        /// falling back to a plain string if that fails).
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 250)]
        poll_interval_ms: u64,
    },

    /// Print the current state of a run.
    Status {
        run_id: String,
    },

    /// List runs known to the server.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        flow_id_prefix: Option<String>,
    },

    /// Pause a running run.
    Pause {
        run_id: String,
        #[arg(long)]
        etag: String,
    },

    /// Resume a paused run.
    Resume {
        run_id: String,
        #[arg(long)]
        etag: String,
    },

    /// Cancel a run.
    Cancel {
        run_id: String,
        #[arg(long)]
        etag: String,
    },

    /// Inject a predefined node onto the run's interruption stack.
    InjectNode {
        run_id: String,
        #[arg(long)]
        etag: String,
        #[arg(long)]
        node_id: String,
        /// Where to splice the node: before_next or after_current.
        #[arg(long, default_value = "after_current")]
        position: String,
    },

    /// Detour into another registered flow.
    Interrupt {
        run_id: String,
        #[arg(long)]
        etag: String,
        #[arg(long)]
        detour_flow_id: String,
        #[arg(long)]
        resume_after: bool,
    },

    /// Inspect a flow graph file without contacting a server.
    Inspect {
        /// Path to a JSON-serialized `FlowGraph`.
        flow_path: PathBuf,
        /// Render the graph as Graphviz DOT instead of a summary.
        #[arg(long)]
        dot: bool,
    },
}

/// Exit codes from spec §6: 0 success, 2 partial, 3 failed, 4 cancelled, 64 usage.
const EXIT_SUCCESS: i32 = 0;
const EXIT_PARTIAL: i32 = 2;
const EXIT_FAILED: i32 = 3;
const EXIT_CANCELLED: i32 = 4;
const EXIT_USAGE: i32 = 64;

#[tokio::main]
async fn main() {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Inspect { flow_path, dot } => inspect(&flow_path, dot),
        other => {
            let client = reqwest::Client::new();
            match dispatch(&client, &cli.server, other).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {e}");
                    EXIT_FAILED
                }
            }
        }
    }
}

fn inspect(flow_path: &PathBuf, dot: bool) -> i32 {
    let text = match std::fs::read_to_string(flow_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: reading {}: {e}", flow_path.display());
            return EXIT_USAGE;
        }
    };
    let graph: FlowGraph = match serde_json::from_str(&text) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("error: parsing {}: {e}", flow_path.display());
            return EXIT_USAGE;
        }
    };
    if dot {
        println!("{}", stepflow_core::visualization::to_dot(&graph));
    } else {
        println!("flow_id: {}", graph.id);
        println!("version: {}", graph.version);
        println!("nodes: {}", graph.node_count());
        for node in graph.nodes() {
            println!("  {} (station={}, start={}, terminal={})", node.id, node.station, node.is_start, node.is_terminal);
        }
    }
    EXIT_SUCCESS
}

async fn dispatch(client: &reqwest::Client, server: &str, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run { flow_id, params, poll_interval_ms } => {
            run_to_completion(client, server, &flow_id, &params, poll_interval_ms).await
        }
        Commands::Status { run_id } => {
            let state = get_state(client, server, &run_id).await?;
            print_json(&state);
            Ok(EXIT_SUCCESS)
        }
        Commands::List { status, flow_id_prefix } => {
            let mut query = Vec::new();
            if let Some(s) = &status {
                query.push(("status", s.clone()));
            }
            if let Some(p) = &flow_id_prefix {
                query.push(("flow_id_prefix", p.clone()));
            }
            let resp = client.get(format!("{server}/runs")).query(&query).send().await?;
            let body: Value = unwrap_response(resp).await?;
            print_json(&body);
            Ok(EXIT_SUCCESS)
        }
        Commands::Pause { run_id, etag } => {
            let body = client
                .post(format!("{server}/runs/{run_id}/pause"))
                .json(&serde_json::json!({ "etag": etag }))
                .send()
                .await?;
            print_json(&unwrap_response::<Value>(body).await?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Resume { run_id, etag } => {
            let body = client
                .post(format!("{server}/runs/{run_id}/resume"))
                .json(&serde_json::json!({ "etag": etag }))
                .send()
                .await?;
            print_json(&unwrap_response::<Value>(body).await?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Cancel { run_id, etag } => {
            let body = client
                .post(format!("{server}/runs/{run_id}/cancel"))
                .json(&serde_json::json!({ "etag": etag }))
                .send()
                .await?;
            print_json(&unwrap_response::<Value>(body).await?);
            Ok(EXIT_SUCCESS)
        }
        Commands::InjectNode { run_id, etag, node_id, position } => {
            let body = client
                .post(format!("{server}/runs/{run_id}/inject_node"))
                .json(&serde_json::json!({ "etag": etag, "node_id": node_id, "position": position }))
                .send()
                .await?;
            print_json(&unwrap_response::<Value>(body).await?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Interrupt { run_id, etag, detour_flow_id, resume_after } => {
            let body = client
                .post(format!("{server}/runs/{run_id}/interrupt"))
                .json(&serde_json::json!({
                    "etag": etag,
                    "detour_flow_id": detour_flow_id,
                    "resume_after": resume_after,
                }))
                .send()
                .await?;
            print_json(&unwrap_response::<Value>(body).await?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Inspect { .. } => unreachable!("handled before dispatch"),
    }
}

async fn run_to_completion(
    client: &reqwest::Client,
    server: &str,
    flow_id: &str,
    params: &[String],
    poll_interval_ms: u64,
) -> anyhow::Result<i32> {
    let params = parse_params(params)?;
    let resp = client
        .post(format!("{server}/runs"))
        .json(&serde_json::json!({ "flow_id": flow_id, "params": params }))
        .send()
        .await?;
    let handle: Value = unwrap_response(resp).await?;
    let run_id = handle["data"]["run_id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("server response missing run_id"))?
        .to_string();
    tracing::info!(run_id = %run_id, flow_id, "run started");

    loop {
        let state = get_state(client, server, &run_id).await?;
        let status = state["data"]["status"].as_str().unwrap_or("");
        match status {
            "succeeded" => {
                print_json(&state);
                return Ok(EXIT_SUCCESS);
            }
            "partial" => {
                print_json(&state);
                return Ok(EXIT_PARTIAL);
            }
            "failed" => {
                print_json(&state);
                return Ok(EXIT_FAILED);
            }
            "cancelled" => {
                print_json(&state);
                return Ok(EXIT_CANCELLED);
            }
            _ => tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await,
        }
    }
}

async fn get_state(client: &reqwest::Client, server: &str, run_id: &str) -> anyhow::Result<Value> {
    let resp = client.get(format!("{server}/runs/{run_id}")).send().await?;
    unwrap_response(resp).await
}

async fn unwrap_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {text}");
    }
    Ok(resp.json().await?)
}

fn parse_params(pairs: &[String]) -> anyhow::Result<serde_json::Map<String, Value>> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("param '{pair}' must be key=value"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

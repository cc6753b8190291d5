use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use mcp_hub::mcp_client::config::{default_config_path, load_config};
use mcp_hub::mcp_client::{McpClient, McpServersConfig};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Run stdio MCP servers and route tool calls across them", version)]
struct Cli {
    /// Config path (default: $MCP_HUB_CONFIG, then <config dir>/mcp-hub/servers.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the per-call timeout in milliseconds.
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Compact JSON output (default: pretty JSON).
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Directory for mcp-hub.log (default: platform data dir).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write log records as JSON lines.
    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured servers without launching them.
    ListServers,
    /// Start every server and print the merged tool catalog.
    ListTools,
    /// Call a tool, routed to whichever server owns it.
    Call {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
    /// Start every server and print per-server status.
    Status,
}

#[derive(Serialize)]
struct ServerEntry<'a> {
    name: &'a str,
    command: &'a str,
    args: &'a [String],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mcp_hub::init_tracing(cli.log_dir.as_deref(), cli.log_json);

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config =
        load_config(&path).with_context(|| format!("loading config {}", path.display()))?;
    if let Some(ms) = cli.call_timeout_ms {
        anyhow::ensure!(ms > 0, "--call-timeout-ms must be greater than zero");
        config.call_timeout_ms = ms;
    }

    match &cli.command {
        Command::ListServers => {
            let mut names: Vec<&String> = config.servers.keys().collect();
            names.sort();
            let entries: Vec<ServerEntry<'_>> = names
                .into_iter()
                .map(|name| {
                    let server = &config.servers[name];
                    ServerEntry {
                        name,
                        command: &server.command,
                        args: &server.args,
                    }
                })
                .collect();
            print_json(&entries, cli.json)?;
        }
        Command::ListTools => {
            let mut client = start(&config).await?;
            let tools = client.list_tools();
            finish(&mut client).await;
            print_json(&tools, cli.json)?;
        }
        Command::Call { tool, args } => {
            let arguments: Value = match args {
                Some(raw) => serde_json::from_str(raw).context("parsing --args as JSON")?,
                None => Value::Object(Default::default()),
            };
            anyhow::ensure!(arguments.is_object(), "--args must be a JSON object");

            let mut client = start(&config).await?;
            let result = client.call_tool(tool, arguments).await;
            finish(&mut client).await;
            print_json(&result?, cli.json)?;
        }
        Command::Status => {
            let mut client = start(&config).await?;
            let status = client.server_status();
            finish(&mut client).await;
            print_json(&status, cli.json)?;
        }
    }

    Ok(())
}

async fn start(config: &McpServersConfig) -> anyhow::Result<McpClient> {
    let mut client = McpClient::from_config(config);
    let report = client
        .initialize(config)
        .await
        .context("starting MCP servers")?;
    for (name, err) in &report.failed {
        eprintln!("WARNING: server '{name}' failed to start: {err}");
    }
    Ok(client)
}

async fn finish(client: &mut McpClient) {
    if let Err(e) = client.shutdown().await {
        eprintln!("WARNING: {e}");
    }
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> anyhow::Result<()> {
    let out = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{out}");
    Ok(())
}

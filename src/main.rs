use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use playground_mcp::agent_core::{InvocationDatabase, ToolRouter};
use playground_mcp::mcp_client::{McpClientConfig, McpSession};

/// playground-mcp - drive the chatbot playground's MCP tool server.
#[derive(Parser)]
#[command(name = "playground-mcp")]
#[command(about = "MCP stdio client for the chatbot playground tool server")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to mcp-client.yaml (default: $PLAYGROUND_CONFIG, then upward search).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database for the tool invocation log.
    #[arg(long, global = true, env = "PLAYGROUND_DB")]
    db: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Session id recorded with each tool invocation (default: random).
    #[arg(short, long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print connection status.
    Status,

    /// List the server's tools.
    Tools,

    /// Show one tool and its parameters.
    Info { tool: String },

    /// Call one tool.
    Call {
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Read one resource.
    Read { uri: String },

    /// Rank tools against an utterance.
    Suggest { utterance: String },

    /// Run the tools a model response asks for (arithmetic is auto-detected).
    Ask {
        utterance: String,

        /// Model output that may contain [TOOL_USE:name:{json}] markers.
        #[arg(short, long, default_value = "")]
        response: String,
    },

    /// Recent invocations for the session.
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Per-tool usage statistics from the invocation log.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = playground_mcp::init_tracing(cli.log_file.as_deref()) {
        eprintln!("error: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = cli.db.unwrap_or_else(playground_mcp::default_db_path);
    let database = Arc::new(InvocationDatabase::open(&db_path.to_string_lossy())?);
    let session_id = cli
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Log-only commands never start the server.
    match &cli.command {
        Commands::History { limit } => {
            return print_json(&database.recent_invocations(&session_id, *limit)?);
        }
        Commands::Stats => return print_json(&database.usage_stats()?),
        _ => {}
    }

    let config = McpClientConfig::resolve(cli.config.as_deref())?;
    if !config.enabled {
        anyhow::bail!("MCP client is disabled (set MCP_ENABLED=true or enabled: true)");
    }

    let session = McpSession::from_config(config);
    session.set_invocation_log(database, session_id.clone());
    session.connect().await?;

    let outcome = execute(&session, cli.command).await;
    session.disconnect().await;
    outcome
}

async fn execute(session: &McpSession, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Status => print_json(&session.status()),
        Commands::Tools => print_json(&session.list_tools()),
        Commands::Info { tool } => {
            let Some(descriptor) = session.tool_info(&tool) else {
                anyhow::bail!("unknown tool '{tool}'");
            };
            let parameters = descriptor.parameters();
            print_json(&serde_json::json!({
                "tool": descriptor,
                "parameters": parameters,
            }))
        }
        Commands::Call { tool, args } => {
            let parameters: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("--args must be a JSON object: {e}"))?;
            let result = session.call_tool(&tool, parameters).await;
            print_json(&result)?;
            if !result.success {
                anyhow::bail!("tool call failed");
            }
            Ok(())
        }
        Commands::Read { uri } => print_json(&session.read_resource(&uri).await),
        Commands::Suggest { utterance } => {
            let router = ToolRouter::new(session.clone());
            print_json(&router.suggest(&utterance))
        }
        Commands::Ask {
            utterance,
            response,
        } => {
            let router = ToolRouter::new(session.clone());
            print_json(&router.dispatch(&response, &utterance).await)
        }
        Commands::History { .. } | Commands::Stats => Ok(()),
    }
}

//! toolexec - command line front end for the tool execution core.
//!
//! Subcommands:
//! - `tools`: list the aggregated catalog
//! - `call`: execute one tool (optionally streaming progress)
//! - `chain`: run a chain document
//! - `health`: probe every enabled backend
//! - `schema`: print JSON Schemas of the chain document or backend settings
//!
//! Every command prints JSON on stdout; logs go to stderr.

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use toolexec_core::backend::{settings_schema, BackendKind};
use toolexec_core::chain::{chain_schema, Chain};
use toolexec_core::types::BackendConfig;
use toolexec_core::{Config, ExecContext, StreamEvent, ToolEngine, ToolRequest};

#[derive(Debug, Parser)]
#[command(author, version, about = "Tool execution core")]
struct Cli {
    /// Path to the JSON config file. Without one, a single built-in
    /// `local` backend is configured.
    #[arg(long, global = true, env = "TOOLEXEC_CONFIG")]
    config: Option<PathBuf>,

    /// Pretty-print JSON output.
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List every tool of every enabled backend.
    Tools(ToolsArgs),
    /// Execute one tool.
    Call(CallArgs),
    /// Run a chain document.
    Chain(ChainArgs),
    /// Probe the health of every enabled backend.
    Health,
    /// Print a JSON Schema.
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
struct ToolsArgs {
    /// Only list tools of this backend.
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Args)]
struct CallArgs {
    /// Tool id, qualified (`backend/tool`) or bare when unambiguous.
    tool: String,

    /// Arguments as one JSON object.
    #[arg(long, default_value = "{}")]
    args: String,

    /// Single argument as `key=value`; the value is parsed as JSON when it
    /// parses, else taken as a string. Repeatable.
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    arg: Vec<String>,

    /// Execution timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Caller identity used for authorization.
    #[arg(long)]
    caller: Option<String>,

    /// Print progress events as JSON lines before the result.
    #[arg(long)]
    stream: bool,
}

#[derive(Debug, Args)]
struct ChainArgs {
    /// Path to the chain document.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SchemaArgs {
    #[command(subcommand)]
    target: SchemaTarget,
}

#[derive(Debug, Subcommand)]
enum SchemaTarget {
    /// The chain document.
    Chain,
    /// Settings of a native backend kind.
    Backend { kind: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if let CliCommand::Schema(args) = &cli.command {
        let schema = match &args.target {
            SchemaTarget::Chain => chain_schema(),
            SchemaTarget::Backend { kind } => {
                let kind = BackendKind::from(kind.clone());
                settings_schema(&kind)
                    .ok_or_else(|| format!("kind '{}' has no native settings", kind))?
            }
        };
        print_json(&schema, cli.pretty)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(cli.config.as_deref())?;
    toolexec_core::observability::init_tracing_with(&config.observability);

    let engine = ToolEngine::from_config(config)?;
    let ctx = ExecContext::new();
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt_received");
            token.cancel();
        }
    });

    engine.start(&ctx).await?;
    let outcome = dispatch(&engine, &ctx, cli.command, cli.pretty).await;
    if let Err(err) = engine.shutdown().await {
        tracing::warn!(error = %err, "shutdown_failed");
    }
    outcome
}

async fn dispatch(
    engine: &ToolEngine,
    ctx: &ExecContext,
    command: CliCommand,
    pretty: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        CliCommand::Tools(args) => {
            let listing = match args.backend {
                Some(name) => {
                    let tools = engine.aggregator().list_backend_tools(ctx, &name).await?;
                    serde_json::json!({ "tools": tools, "warnings": [] })
                }
                None => serde_json::to_value(engine.list_tools(ctx).await)?,
            };
            print_json(&listing, pretty)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Call(args) => {
            let request = build_request(&args)?;
            let result = if args.stream {
                let mut stream = engine.stream(ctx, request).await;
                let mut terminal = None;
                while let Some(event) = stream.next().await {
                    match event {
                        StreamEvent::Progress(_) => print_json(&event, false)?,
                        StreamEvent::Completed(result) => terminal = Some(result),
                    }
                }
                terminal.ok_or("stream ended without a result")?
            } else {
                engine.call(ctx, request).await
            };
            print_json(&result, pretty)?;
            Ok(exit_code(result.is_success()))
        }
        CliCommand::Chain(args) => {
            let chain = Chain::from_file(&args.file)?;
            let result = engine.run_chain(ctx, &chain).await;
            print_json(&result, pretty)?;
            Ok(exit_code(result.is_success()))
        }
        CliCommand::Health => {
            let report = engine.check_health(ctx).await;
            let healthy = report.values().all(|s| s.healthy);
            print_json(&report, pretty)?;
            Ok(exit_code(healthy))
        }
        CliCommand::Schema(_) => Ok(ExitCode::SUCCESS),
    }
}

fn load_config(path: Option<&std::path::Path>) -> toolexec_core::Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => {
            let mut config = Config::default();
            config
                .backends
                .insert("local".into(), BackendConfig::new(BackendKind::Local));
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_request(args: &CallArgs) -> Result<ToolRequest, Box<dyn std::error::Error>> {
    let mut arguments: Map<String, Value> = match serde_json::from_str(&args.args)? {
        Value::Object(map) => map,
        other => return Err(format!("--args must be a JSON object, got {}", other).into()),
    };
    for pair in &args.arg {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("--arg '{}' is not KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        arguments.insert(key.to_string(), value);
    }

    let mut request = ToolRequest::new(args.tool.clone()).with_arguments(arguments);
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if let Some(caller) = &args.caller {
        request = request.with_caller(caller.clone());
    }
    Ok(request)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> serde_json::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

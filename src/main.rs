use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{error, info};

use expenseflow::{
    adapters::{
        inbound::server::ServerAdapter,
        outbound::{
            clock::SystemClock, http::HttpExpenseGateway, local::LocalExpenseGateway,
            persistence::SqliteRunStore, telemetry::TracingTelemetrySink,
        },
    },
    application::{ExpenseRuntime, RuntimeParts},
    cli::{Cli, Commands, ServeArgs, StartArgs, StatusArgs},
    config::{ExpenseflowConfig, GatewayKind},
    core::ports::{ExpenseGateway, RunRepository},
    status_export::{RunDetailExport, RunListExport},
};

mod tracing_setup;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let file_log = matches!(cli.command, Commands::Serve(_));
    let guard = tracing_setup::init(cli.verbose, cli.log_json, cli.log_json_format, file_log);

    let result = match cli.command {
        Commands::Serve(args) => serve_command(args).await,
        Commands::Start(args) => start_command(args).await,
        Commands::Status(args) => status_command(args).await,
    };

    if let Err(err) = result {
        error!(error = %format!("{err:#}"), "command failed");
        drop(guard);
        std::process::exit(1);
    }
}

async fn serve_command(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind/port combination for serve command")?;

    let store = SqliteRunStore::open(None)?;
    info!(db = %store.db_path().display(), "opened run store");

    let gateway_url = match config.gateway.kind {
        GatewayKind::Http => Some(
            config
                .gateway
                .url
                .clone()
                .unwrap_or_else(|| self_url(&addr)),
        ),
        GatewayKind::Local => None,
    };
    let http_gateway = gateway_url
        .as_deref()
        .map(HttpExpenseGateway::new)
        .transpose()?;

    let runtime = ExpenseRuntime::assemble(
        RuntimeParts {
            store: Arc::new(store),
            clock: Arc::new(SystemClock::new()),
            telemetry: Arc::new(TracingTelemetrySink::new()),
            timeouts: config.workflow.step_timeouts(),
            options: config.workflow.engine_options(),
        },
        move |book, registry| match http_gateway {
            Some(http) => Arc::new(http) as Arc<dyn ExpenseGateway>,
            None => Arc::new(LocalExpenseGateway::new(book, registry)) as Arc<dyn ExpenseGateway>,
        },
    );

    let recovered = runtime
        .engine
        .recover()
        .await
        .context("Failed to recover unfinished runs")?;
    if recovered > 0 {
        info!(recovered, "replayed unfinished runs");
    }
    let _sweeper = runtime.engine.spawn_sweeper();

    info!(
        %addr,
        gateway = ?config.gateway.kind,
        task_queue = %runtime.engine.task_queue(),
        "serving expense workflow API"
    );
    ServerAdapter::new(runtime.service.clone()).run(addr).await
}

async fn start_command(args: StartArgs) -> Result<()> {
    let url = format!(
        "{}/v1/workflow/starter",
        args.server_url.trim_end_matches('/')
    );
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .context("Failed to read starter response")?;
    if !status.is_success() {
        return Err(anyhow!("starter returned {status}: {body}"));
    }
    let payload: serde_json::Value =
        serde_json::from_str(&body).context("Starter returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn status_command(args: StatusArgs) -> Result<()> {
    let store = SqliteRunStore::open(None)?;
    if let Some(id) = args.workflow_id {
        let run = store
            .load(&id)
            .await?
            .ok_or_else(|| anyhow!("No run recorded for workflow {id}"))?;
        let detail = RunDetailExport::from_run(&run);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&detail)?);
        } else {
            println!("Workflow: {}", detail.summary.workflow_id);
            println!("Run: {}", detail.summary.run_id);
            println!("Expense: {}", detail.summary.expense_id);
            println!("Status: {}", detail.summary.status);
            println!("Stage: {}", detail.summary.stage);
            if let (Some(step), Some(deadline)) = (&detail.waiting_on, detail.deadline_ms) {
                println!("Waiting on {step} until {deadline}");
            }
            if let Some(result) = &detail.summary.result {
                println!("Result: {result}");
            }
            println!("Updated: {}", detail.summary.updated_at_ms);
        }
    } else {
        let runs = store.list(args.limit.max(1)).await?;
        let payload = RunListExport::from_runs(&runs);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else if payload.runs.is_empty() {
            println!("No runs recorded yet.");
        } else {
            println!("Recent runs:");
            for run in payload.runs {
                println!(
                    "- {} [{}] stage={} updated={} result={}",
                    run.workflow_id,
                    run.status,
                    run.stage,
                    run.updated_at_ms,
                    run.result.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ExpenseflowConfig> {
    match path {
        Some(path) => ExpenseflowConfig::from_path(path),
        None => Ok(ExpenseflowConfig::default()),
    }
}

/// URL the server can use to reach its own HTTP API.
fn self_url(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}", addr.port())
    } else {
        format!("http://{addr}")
    }
}

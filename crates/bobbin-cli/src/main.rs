use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bobbin_core::app::{AdminResult, DlqRequest};
use bobbin_core::domain::{DlqStatus, NewTask, Overall, TenantId, TraceId};
use bobbin_core::impls::{FanoutEventSink, JsonlEventSink, StateFile, TracingEventSink};
use bobbin_core::observability::{self, LogFormat};
use bobbin_core::ports::{Clock, DlqFilter, EventSink, SystemClock};
use bobbin_core::{App, AppBuilder, RuntimeConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;

mod demo;

/// Operate a bobbin task runtime.
#[derive(Parser, Debug)]
#[command(name = "bobbin", version)]
struct Cli {
    /// State file shared by every invocation, including a running `run` (JSON, locked per operation).
    #[arg(long, global = true, default_value = "bobbin-state.json")]
    state: PathBuf,

    /// Runtime config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append audit events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,

    /// Operator name recorded on audit events.
    #[arg(long, global = true, default_value = "operator")]
    actor: String,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Activate the emergency stop.
    Stop {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Clear the emergency stop.
    Resume {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Print the health posture.
    Status {
        /// Exit non-zero when the posture is RED.
        #[arg(long)]
        fail_on_red: bool,
    },
    /// Enqueue a task for one of the demo capabilities.
    Enqueue {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        capability: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        trace_id: Option<String>,
    },
    /// Run the demo workers, reaper and health monitor for a while.
    Run {
        #[arg(long, default_value_t = 10)]
        for_secs: u64,
    },
    #[command(subcommand)]
    Dlq(DlqCommand),
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    Pause {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Unpause {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Cancel every pending task of a tenant. Irreversible.
    Drain {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
    },
    DryRun {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
        #[arg(long)]
        max: Option<usize>,
    },
    Replay {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
        #[arg(long)]
        max: Option<usize>,
    },
    List {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        status: Option<DlqStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Quarantine {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Release {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        id: String,
    },
    Analyze {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Execute a JSON request (`-` reads stdin).
    Request { json: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    observability::init(format, "info");

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` means the command ran but reported failure.
async fn run(cli: Cli) -> Result<bool> {
    let config = RuntimeConfig::load_or_default(cli.config.as_deref())
        .context("failed to load runtime config")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(StateFile::new(&cli.state, clock.clone()));
    state
        .load()
        .await
        .with_context(|| format!("failed to load state from {}", cli.state.display()))?;

    let events: Arc<dyn EventSink> = match &cli.events {
        Some(path) => Arc::new(FanoutEventSink::new(vec![
            Arc::new(TracingEventSink) as Arc<dyn EventSink>,
            Arc::new(JsonlEventSink::new(path)),
        ])),
        None => Arc::new(TracingEventSink),
    };

    let app = demo::register(AppBuilder::new())?
        .expect_capabilities(demo::CAPABILITIES)
        .config(config)
        .actor(cli.actor.clone())
        .clock(clock)
        .state_file(state)
        .event_sink(events)
        .build()?;
    tracing::debug!(state = %cli.state.display(), "state file opened");

    execute(&app, cli.command).await
}

async fn execute(app: &App, command: Command) -> Result<bool> {
    let admin = app.admin();
    let ok = match command {
        Command::Stop { reason } => report(admin.stop(&reason).await)?,
        Command::Resume { reason } => report(admin.resume(&reason).await)?,
        Command::Status { fail_on_red } => {
            let posture = admin.status().await;
            eprintln!("{}", posture.overall);
            for rec in &posture.recommendations {
                eprintln!("  - {rec}");
            }
            print_json(&posture)?;
            !(fail_on_red && posture.overall == Overall::Red)
        }
        Command::Enqueue {
            tenant,
            capability,
            payload,
            trace_id,
        } => {
            let tenant = TenantId::parse(tenant)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be JSON")?;
            let mut task = NewTask::new(tenant, capability.as_str(), payload);
            if let Some(trace_id) = trace_id {
                task = task.with_trace_id(TraceId::new(trace_id));
            }
            let record = app.enqueue(task).await?;
            eprintln!("enqueued {}", record.id);
            if let Some(link) = app.trace_link(&record) {
                eprintln!("  trace: {link}");
            }
            print_json(&record)?;
            true
        }
        Command::Run { for_secs } => {
            let running = app.start().await;
            eprintln!(
                "running {} worker(s) for {for_secs}s",
                running.worker_ids().len()
            );
            tokio::time::sleep(Duration::from_secs(for_secs)).await;
            let posture = running.health().latest();
            running.shutdown().await;
            eprintln!("{}", posture.overall);
            print_json(&posture)?;
            true
        }
        Command::Dlq(command) => execute_dlq(app, command).await?,
    };
    Ok(ok)
}

async fn execute_dlq(app: &App, command: DlqCommand) -> Result<bool> {
    let admin = app.admin();
    let ok = match command {
        DlqCommand::Pause { tenant, reason } => {
            report(admin.pause(tenant.as_deref(), &reason).await)?
        }
        DlqCommand::Unpause { tenant, reason } => {
            report(admin.unpause(tenant.as_deref(), &reason).await)?
        }
        DlqCommand::Drain { tenant, reason } => {
            report(admin.drain(tenant.as_deref(), &reason).await)?
        }
        DlqCommand::DryRun { tenant, ids, max } => report(
            admin
                .dry_run(tenant.as_deref(), ids.as_deref(), max)
                .await,
        )?,
        DlqCommand::Replay { tenant, ids, max } => report(
            admin
                .replay(tenant.as_deref(), ids.as_deref(), max)
                .await,
        )?,
        DlqCommand::Quarantine { tenant, id, reason } => {
            report(admin.quarantine(tenant.as_deref(), &id, &reason).await)?
        }
        DlqCommand::Release { tenant, id } => {
            report(admin.release(tenant.as_deref(), &id).await)?
        }
        DlqCommand::List {
            tenant,
            status,
            limit,
        } => {
            let filter = DlqFilter {
                tenant_id: tenant.map(TenantId::parse).transpose()?,
                status,
                limit,
            };
            let items = app.dlq().list(&filter).await?;
            eprintln!("{} item(s)", items.len());
            print_json(&items)?;
            true
        }
        DlqCommand::Analyze { tenant } => {
            let tenant = tenant.map(TenantId::parse).transpose()?;
            let analysis = app.dlq().analyze(tenant.as_ref()).await?;
            eprintln!("{} item(s), {} bytes", analysis.total, analysis.total_payload_bytes);
            if let Some(rate) = analysis.replay.fail_rate {
                let flag = if analysis.replay.threshold_exceeded { " (above threshold)" } else { "" };
                eprintln!("replay fail rate {:.0}%{flag}", rate * 100.0);
            }
            print_json(&analysis)?;
            true
        }
        DlqCommand::Request { json } => {
            let raw = if json == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("failed to read request from stdin")?;
                buf
            } else {
                json
            };
            let request: DlqRequest =
                serde_json::from_str(&raw).context("invalid dlq request")?;
            let response = admin.handle_dlq(request).await;
            match &response.error {
                Some(error) => eprintln!("{} failed: {error}", response.action.as_str()),
                None => eprintln!("{} ok", response.action.as_str()),
            }
            print_json(&response)?;
            response.ok
        }
    };
    Ok(ok)
}

fn report(result: AdminResult) -> Result<bool> {
    let marker = if result.success { "ok" } else { "FAILED" };
    eprintln!("[{marker}] {}: {}", result.action, result.message);
    print_json(&result)?;
    Ok(result.success)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

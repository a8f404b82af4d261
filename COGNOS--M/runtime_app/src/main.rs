use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cognos_kernel::{
    config::RuntimeConfig,
    loopback::{
        GraphMemory, LoopbackTools, RecordingAudit, RecordingCommunication,
        RecordingRuntimeControl, RecordingWiseAuthority, ScriptedLlm,
    },
    ServiceProvider, TaskId, TaskSpec,
};
use cognos_scheduler::AgentRuntime;
use cognos_servicebus::ServiceRegistration;
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cognosd", version, about = "Cognos agent runtime over loopback providers")]
struct Cli {
    /// Emit debug-level traces.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a task file to completion, then shuts down.
    Run(RunArgs),
    /// Validates a config file and prints the effective values.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// JSON array of task specs.
    #[arg(long)]
    tasks: PathBuf,
    /// Rounds before shutdown is requested regardless of open tasks.
    #[arg(long, default_value_t = 500)]
    max_rounds: u64,
    /// Directory for the JSON log and the event log.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Handles kept to report what the loopback providers saw.
struct Loopback {
    comms: Arc<RecordingCommunication>,
    wa: Arc<RecordingWiseAuthority>,
    audit: Arc<RecordingAudit>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("installing trace subscriber")?;

    match cli.command {
        Commands::Run(args) => handle_run(args).await,
        Commands::CheckConfig { config } => {
            let config = RuntimeConfig::load(&config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_run(args: RunArgs) -> Result<()> {
    let mut config = RuntimeConfig::load(&args.config)?;
    if let Some(dir) = &args.log_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        config.telemetry.log_path = Some(dir.join("cognosd.jsonl"));
        config.telemetry.event_log_path = Some(dir.join("events.jsonl"));
    }
    let specs = read_tasks(&args.tasks)?;
    let interval = config.scheduler.round_interval();

    let (runtime, loopback) = wire(config)?;
    let mut submitted: Vec<TaskId> = Vec::with_capacity(specs.len());
    for spec in specs {
        submitted.push(runtime.submit_task(spec)?);
    }
    info!(tasks = submitted.len(), "tasks submitted");

    let mut rounds = 0_u64;
    let mut shutdown: Option<TaskId> = None;
    while !runtime.is_finished() {
        runtime.run_round().await;
        rounds += 1;
        if shutdown.is_none() {
            let settled = submitted.iter().all(|id| {
                runtime
                    .get_task_status(*id)
                    .is_ok_and(|status| status.is_terminal())
            });
            if settled || rounds >= args.max_rounds {
                if !settled {
                    warn!(rounds, "round limit reached with open tasks");
                }
                shutdown = Some(runtime.request_shutdown("task file processed"));
            }
        }
        tokio::time::sleep(interval).await;
    }

    let report = json!({
        "rounds": rounds,
        "status": runtime.get_runtime_status(),
        "tasks": submitted
            .iter()
            .filter_map(|id| runtime.task_record(*id))
            .collect::<Vec<_>>(),
        "shutdown_task": shutdown.and_then(|id| runtime.task_record(id)),
        "transitions": runtime.transitions(),
        "variance_reports": runtime.variance_reports(),
        "messages_sent": loopback.comms.sent(),
        "deferrals": loopback.wa.deferrals(),
        "audit_entries": loopback.audit.entries().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_tasks(path: &Path) -> Result<Vec<TaskSpec>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn wire(config: RuntimeConfig) -> Result<(AgentRuntime, Loopback)> {
    let comms = Arc::new(RecordingCommunication::new("loopback-chat"));
    if let Some(channel) = &config.scheduler.home_channel {
        comms.seed(channel, "operator", "cognosd started");
    }
    let wa = Arc::new(RecordingWiseAuthority::new("loopback-wa"));
    let audit = Arc::new(RecordingAudit::new());
    let tools = LoopbackTools::new("loopback-tools")
        .with_static_tool("echo", json!({ "ok": true }))
        .with_static_tool("clock", json!({ "source": "cognosd" }));

    let runtime = AgentRuntime::builder(config)
        .audit(audit.clone())
        .service(ServiceRegistration::new(
            "loopback-llm",
            ServiceProvider::Llm(Arc::new(ScriptedLlm::cooperative("loopback-llm"))),
        ))
        .service(ServiceRegistration::new(
            "loopback-chat",
            ServiceProvider::Communication(comms.clone()),
        ))
        .service(ServiceRegistration::new(
            "loopback-memory",
            ServiceProvider::Memory(Arc::new(GraphMemory::new("loopback-memory"))),
        ))
        .service(ServiceRegistration::new(
            "loopback-wa",
            ServiceProvider::WiseAuthority(wa.clone()),
        ))
        .service(ServiceRegistration::new(
            "loopback-tools",
            ServiceProvider::Tool(Arc::new(tools)),
        ))
        .service(ServiceRegistration::new(
            "loopback-control",
            ServiceProvider::RuntimeControl(Arc::new(RecordingRuntimeControl::new("loopback-control"))),
        ))
        .build()?;
    Ok((runtime, Loopback { comms, wa, audit }))
}

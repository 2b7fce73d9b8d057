use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;
use xburn::config::AppConfig;
use xburn::core::models::{BlankMode, Device, FormatMode, LogLine, SpeedOption};
use xburn::core::{Job, Orchestrator, Project};
use xburn::logging::{self, LogConfig};
use xburn::rpc::methods::{DaemonStatus, JobStarted, MediaReply, Selection};
use xburn::rpc::{RpcClient, RpcServer};
use xburn::{adapters, context};

#[derive(Parser)]
#[command(name = "xburn")]
#[command(about = "Optical disc burning daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Address of the daemon's RPC listener.
    #[arg(long, global = true)]
    rpc_bind: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and RPC server until Ctrl-C.
    Daemon(DaemonArgs),
    Status,
    Devices {
        /// Re-enumerate drives first.
        #[arg(long)]
        refresh: bool,
    },
    Select {
        path: String,
    },
    Media {
        #[arg(long)]
        refresh: bool,
    },
    Speeds,
    Eject {
        #[arg(long)]
        device: Option<String>,
    },
    Blank {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        mode: Option<BlankMode>,
    },
    Format {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        mode: Option<FormatMode>,
    },
    Burn(BurnArgs),
    Cancel,
    Job,
    Log,
    Reset,
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Serialize, Clone, Default)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    xorriso_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(skip)]
    rpc_bind: Option<String>,
}

#[derive(Args)]
struct BurnArgs {
    /// Project document (JSON).
    project: PathBuf,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    speed: Option<String>,
    #[arg(long)]
    dummy: Option<bool>,
    #[arg(long)]
    verify: Option<bool>,
    #[arg(long)]
    eject: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = match &cli.command {
        Commands::Daemon(args) => DaemonArgs {
            rpc_bind: cli.rpc_bind.clone(),
            ..args.clone()
        },
        _ => DaemonArgs {
            rpc_bind: cli.rpc_bind.clone(),
            ..Default::default()
        },
    };
    let config = AppConfig::new(Some(&overrides)).context("Failed to load configuration")?;

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed"),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        command => run_client(command, &config)
            .await
            .context("Request to the daemon failed"),
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let bind = config.rpc_bind;
    let backend = adapters::get_backend(&config);
    let ctx = context::AppContext::new(config, backend);
    let orchestrator = Arc::new(Orchestrator::new(ctx));
    orchestrator.start().await;

    let server = RpcServer::bind(Arc::clone(&orchestrator), bind)
        .await
        .with_context(|| format!("Failed to bind RPC listener on {bind}"))?;
    let shutdown = CancellationToken::new();
    let serving = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    let _ = serving.await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_client(command: Commands, config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);

    match command {
        Commands::Status => {
            let status: DaemonStatus = client.call_no_params("daemon.status").await?;
            let mode = if status.simulation { ", simulated" } else { "" };
            println!("xburn {} ({} backend{mode})", status.version, status.backend);
            println!("Uptime:   {}s", status.uptime_secs);
            println!("Drives:   {}", status.device_count);
            println!("Selected: {}", status.current_device.as_deref().unwrap_or("-"));
            match status.current_job {
                Some(job) => print_job(&job),
                None => println!("Job:      none"),
            }
        }
        Commands::Devices { refresh } => {
            let method = if refresh { "devices.refresh" } else { "devices.list" };
            let devices: Vec<Device> = client.call_no_params(method).await?;
            if devices.is_empty() {
                println!("No drives found");
            }
            for device in devices {
                let caps: Vec<&str> = device.capabilities.iter().map(String::as_str).collect();
                println!("{}  {}  [{}]", device.path, device.name, caps.join(", "));
            }
        }
        Commands::Select { path } => {
            let selection: Selection = call(&client, "devices.select", json!({ "path": path })).await?;
            print_json(&selection)?;
        }
        Commands::Media { refresh } => {
            let method = if refresh { "media.refresh" } else { "media.get" };
            let media: MediaReply = client.call_no_params(method).await?;
            print_json(&media)?;
        }
        Commands::Speeds => {
            let speeds: Vec<SpeedOption> = client.call_no_params("speeds.get").await?;
            for speed in speeds {
                println!("{:>8}  {}", speed.value, speed.label);
            }
        }
        Commands::Eject { device } => {
            let _: Value = call(&client, "disc.eject", json!({ "device": device })).await?;
            println!("Ejected");
        }
        Commands::Blank { device, mode } => {
            started(&client, "disc.blank", json!({ "device": device, "mode": mode })).await?;
        }
        Commands::Format { device, mode } => {
            started(&client, "disc.format", json!({ "device": device, "mode": mode })).await?;
        }
        Commands::Burn(args) => {
            let text = tokio::fs::read_to_string(&args.project)
                .await
                .with_context(|| format!("Failed to read {}", args.project.display()))?;
            let project: Project = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", args.project.display()))?;

            let mut options = config.default_burn.clone();
            if let Some(speed) = args.speed {
                options.speed = speed;
            }
            if let Some(dummy) = args.dummy {
                options.dummy_mode = dummy;
            }
            if let Some(verify) = args.verify {
                options.verify = verify;
            }
            if let Some(eject) = args.eject {
                options.eject = eject;
            }

            let params = json!({ "project": project, "device": args.device, "options": options });
            started(&client, "burn.start", params).await?;
        }
        Commands::Cancel => {
            let job: Option<Job> = client.call_no_params("burn.cancel").await?;
            match job {
                Some(job) => print_job(&job),
                None => println!("No job"),
            }
        }
        Commands::Job => {
            let job: Option<Job> = client.call_no_params("job.refresh").await?;
            match job {
                Some(job) => print_job(&job),
                None => println!("No job"),
            }
        }
        Commands::Log => {
            let lines: Vec<LogLine> = client.call_no_params("log.lines").await?;
            for line in lines {
                println!("{line}");
            }
        }
        Commands::Reset => {
            let _: Value = client.call_no_params("job.reset").await?;
            println!("Job cleared");
        }
        Commands::Daemon(_) | Commands::Config => anyhow::bail!("not a client command"),
    }
    Ok(())
}

async fn started(client: &RpcClient, method: &str, params: Value) -> Result<()> {
    let reply: JobStarted = call(client, method, params).await?;
    println!("Started job {}", reply.job_id);
    Ok(())
}

async fn call<T: DeserializeOwned>(client: &RpcClient, method: &str, params: Value) -> Result<T> {
    Ok(client.call(method, Some(params)).await?)
}

fn print_job(job: &Job) {
    println!("Job:      {} ({} on {})", job.id, job.kind, job.device_path);
    println!("State:    {}", job.state);
    if job.is_busy() {
        let progress = &job.progress;
        println!(
            "Progress: {:.1}% {} {}",
            progress.percent, progress.speed, progress.eta
        );
    }
    if let Some(result) = &job.result {
        println!(
            "Result:   {}",
            result.message.as_deref().unwrap_or(if result.success { "ok" } else { "failed" })
        );
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
